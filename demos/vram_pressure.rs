use gpumm_rs::hw::channel::SoftChannel;
use gpumm_rs::{CacheStats, DeviceBuilder, Domain};
use std::sync::Arc;

const BLOCK: u64 = 4096;

fn print_cache(label: &str, s: &CacheStats) {
    println!(
        "    {label:<28} T1={:>3} T2={:>3} B1={:>3} B2={:>3} pinned={:>3} free={:>3} p={}",
        s.t1_blocks, s.t2_blocks, s.b1_blocks, s.b2_blocks, s.pinned_blocks, s.free_blocks,
        s.target_t1
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== VRAM pressure on a 100-block pool ===");

    let dev = DeviceBuilder::new(100).build()?;
    let ctx = dev.open_context();
    let hw = Arc::new(SoftChannel::new());
    let chan = dev.create_channel(hw.clone());

    // 1. Three 40-block objects: the third pushes the first out.
    let mut handles = Vec::new();
    for i in 0..3 {
        let h = dev.create_object(&ctx, 40 * BLOCK)?;
        dev.write(&ctx, h, 0, format!("object {i}").as_bytes())?;
        dev.move_object(&ctx, h, Domain::Vram)?;
        handles.push(h);
        print_cache(&format!("after placing object {i}"), &dev.stats().cache);
    }

    // 2. Fault the first one back: a ghost hit that shifts p.
    let mut buf = [0u8; 8];
    dev.read(&ctx, handles[0], 0, &mut buf)?;
    println!("[+] Object 0 reads back {:?}", String::from_utf8_lossy(&buf));
    print_cache("after ghost hit", &dev.stats().cache);

    // 3. Submit work on object 1 and try to place something huge.
    let submission = dev.exec(&ctx, chan, &[handles[1]])?;
    println!(
        "[+] Submitted seqno {} with object 1 at {:?}",
        submission.seqno, submission.placements[0].offset
    );
    let big = dev.create_object(&ctx, 90 * BLOCK)?;
    match dev.move_object(&ctx, big, Domain::Vram) {
        Ok(p) => println!("[!] 90-block object placed at {:?}", p.offset),
        Err(e) => println!("[+] 90-block object refused: {e}"),
    }
    print_cache("while object 1 is busy", &dev.stats().cache);

    // 4. Let the "GPU" finish and retire.
    hw.complete_all();
    let retired = dev.retire(chan)?;
    println!("[+] Retired {retired} request(s)");
    let p = dev.move_object(&ctx, big, Domain::Vram)?;
    println!("[+] 90-block object placed at {:?}", p.offset);
    print_cache("after retirement", &dev.stats().cache);

    let stats = dev.stats();
    println!(
        "[+] {} objects, {} KiB total",
        stats.object_count,
        stats.object_memory / 1024
    );
    println!("[+] Closed context with {} handles", dev.close_context(ctx));
    Ok(())
}
