use gpumm_rs::hw::channel::SoftChannel;
use gpumm_rs::hw::timer::ManualClock;
use gpumm_rs::{CacheClass, ChannelId, Device, DeviceBuilder, Domain, MmError};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BLOCK: u64 = 4096;

fn device(total_blocks: u32) -> Device {
    DeviceBuilder::new(total_blocks).build().unwrap()
}

fn manual_device(total_blocks: u32) -> (Device, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let dev = DeviceBuilder::new(total_blocks)
        .with_clock(clock.clone())
        .build()
        .unwrap();
    (dev, clock)
}

#[test]
fn third_placement_evicts_the_oldest() {
    let dev = device(100);
    let ctx = dev.open_context();
    let handles: Vec<_> = (0..3)
        .map(|_| dev.create_object(&ctx, 40 * BLOCK).unwrap())
        .collect();
    for &h in &handles {
        dev.move_object(&ctx, h, Domain::Vram).unwrap();
    }

    let first = dev.object_info(&ctx, handles[0]).unwrap();
    assert_eq!(first.cache_class, CacheClass::B1);
    assert!(first.swapped_out);
    assert_eq!(first.placement.offset, None);

    let cache = dev.stats().cache;
    assert_eq!(cache.t1_blocks, 80);
    assert_eq!(cache.b1_blocks, 40);
    assert_eq!(cache.free_blocks, 20);
}

#[test]
fn pinned_object_survives_an_oversized_request() {
    let dev = device(100);
    let ctx = dev.open_context();
    let chan = dev.create_channel(Arc::new(SoftChannel::new()));

    let a = dev.create_object(&ctx, 30 * BLOCK).unwrap();
    dev.exec(&ctx, chan, &[a]).unwrap();

    let big = dev.create_object(&ctx, 90 * BLOCK).unwrap();
    assert!(matches!(
        dev.move_object(&ctx, big, Domain::Vram),
        Err(MmError::OutOfMemory)
    ));

    let info = dev.object_info(&ctx, a).unwrap();
    assert_eq!(info.cache_class, CacheClass::Pinned);
    assert_eq!(info.placement.offset, Some(0));
    assert_eq!(dev.stats().cache.free_blocks, 70);
}

#[test]
fn retiring_seqno_five_releases_its_objects() {
    let (dev, _clock) = manual_device(64);
    let ctx = dev.open_context();
    let hw = Arc::new(SoftChannel::new());
    let chan = dev.create_channel(hw.clone());

    for expected in 1..=4 {
        assert_eq!(dev.exec(&ctx, chan, &[]).unwrap().seqno, expected);
    }
    let a = dev.create_object(&ctx, 4 * BLOCK).unwrap();
    let b = dev.create_object(&ctx, 8 * BLOCK).unwrap();
    let submission = dev.exec(&ctx, chan, &[a, b]).unwrap();
    assert_eq!(submission.seqno, 5);
    assert_eq!(submission.placements.len(), 2);
    assert_eq!(hw.last_emitted(), 5);

    for h in [a, b] {
        let info = dev.object_info(&ctx, h).unwrap();
        assert_eq!(info.last_seqno, 5);
        assert_eq!(info.cache_class, CacheClass::Pinned);
    }

    hw.complete_up_to(5);
    assert_eq!(dev.retire(chan).unwrap(), 5);
    assert_eq!(dev.pending(chan).unwrap(), 0);

    for h in [a, b] {
        let info = dev.object_info(&ctx, h).unwrap();
        assert_eq!(info.last_seqno, 0);
        assert_eq!(info.cache_class, CacheClass::T1);
        assert!(info.referenced);
    }
    assert_eq!(dev.stats().cache.pinned_blocks, 0);
}

#[test]
fn work_not_yet_completed_stays_pinned() {
    let dev = device(16);
    let ctx = dev.open_context();
    let hw = Arc::new(SoftChannel::new());
    let chan = dev.create_channel(hw.clone());

    let a = dev.create_object(&ctx, BLOCK).unwrap();
    let b = dev.create_object(&ctx, BLOCK).unwrap();
    let sa = dev.exec(&ctx, chan, &[a]).unwrap().seqno;
    dev.exec(&ctx, chan, &[b]).unwrap();

    hw.complete_up_to(sa);
    assert_eq!(dev.retire(chan).unwrap(), 1);
    assert_eq!(dev.pending(chan).unwrap(), 1);
    assert_eq!(
        dev.object_info(&ctx, a).unwrap().cache_class,
        CacheClass::T1
    );
    assert_eq!(
        dev.object_info(&ctx, b).unwrap().cache_class,
        CacheClass::Pinned
    );
}

#[test]
fn export_import_round_trip() {
    let dev = device(16);
    let owner = dev.open_context();
    let other = dev.open_context();

    let h = dev.create_object(&owner, 2 * BLOCK).unwrap();
    dev.write(&owner, h, 0, b"shared").unwrap();
    let name = dev.export_name(&owner, h).unwrap();
    assert_eq!(dev.export_name(&owner, h).unwrap(), name);

    let imported = dev.import_name(&other, name).unwrap();
    assert_eq!(
        dev.lookup(&owner, h).unwrap().bo(),
        dev.lookup(&other, imported).unwrap().bo()
    );

    dev.delete_handle(&owner, h).unwrap();
    assert_eq!(dev.stats().object_count, 1);
    let mut buf = [0u8; 6];
    dev.read(&other, imported, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");

    dev.release_name(&other, imported).unwrap();
    assert!(matches!(
        dev.import_name(&other, name),
        Err(MmError::NotFound(_))
    ));
    assert_eq!(dev.stats().object_count, 1);

    dev.delete_handle(&other, imported).unwrap();
    assert_eq!(dev.stats().object_count, 0);
    assert_eq!(dev.stats().object_memory, 0);
}

#[test]
fn last_handle_takes_the_name_with_it() {
    let dev = device(16);
    let ctx = dev.open_context();
    let h = dev.create_object(&ctx, 2 * BLOCK).unwrap();
    dev.move_object(&ctx, h, Domain::Vram).unwrap();
    let name = dev.export_name(&ctx, h).unwrap();

    dev.delete_handle(&ctx, h).unwrap();
    assert!(matches!(dev.import_name(&ctx, name), Err(MmError::NotFound(_))));
    assert_eq!(dev.close_context(ctx), 0);
    let stats = dev.stats();
    assert_eq!(stats.object_count, 0);
    assert_eq!(stats.cache.objects, 0);
    assert_eq!(stats.cache.free_blocks, 16);
}

#[test]
fn closing_the_last_context_drops_shared_names() {
    let dev = device(16);
    let owner = dev.open_context();
    let other = dev.open_context();
    let h = dev.create_object(&owner, BLOCK).unwrap();
    let name = dev.export_name(&owner, h).unwrap();
    dev.import_name(&other, name).unwrap();

    assert_eq!(dev.close_context(owner), 1);
    assert_eq!(dev.stats().object_count, 1);
    let again = dev.import_name(&other, name).unwrap();
    assert_eq!(dev.object_info(&other, again).unwrap().name, Some(name));

    assert_eq!(dev.close_context(other), 2);
    assert_eq!(dev.stats().object_count, 0);
}

#[test]
fn exec_reports_where_objects_landed() {
    let dev = device(32);
    let ctx = dev.open_context();
    let chan = dev.create_channel(Arc::new(SoftChannel::new()));

    let a = dev.create_object(&ctx, 4 * BLOCK).unwrap();
    let b = dev.create_object(&ctx, 8 * BLOCK).unwrap();
    dev.move_object(&ctx, b, Domain::Vram).unwrap();

    let submission = dev.exec(&ctx, chan, &[a, b]).unwrap();
    assert_eq!(submission.seqno, 1);
    let expected: Vec<_> = [a, b]
        .iter()
        .map(|&h| dev.placement(&ctx, h).unwrap())
        .collect();
    assert_eq!(submission.placements, expected);
    assert!(submission.placements.iter().all(|p| p.domain == Domain::Vram));
    assert_eq!(submission.placements[1].offset, Some(0));
    assert_eq!(submission.placements[0].offset, Some(8 * BLOCK));
}

#[test]
fn contents_survive_eviction() {
    let dev = device(100);
    let ctx = dev.open_context();
    let a = dev.create_object(&ctx, 60 * BLOCK).unwrap();
    let b = dev.create_object(&ctx, 60 * BLOCK).unwrap();

    dev.move_object(&ctx, a, Domain::Vram).unwrap();
    dev.write(&ctx, a, 59 * BLOCK + 10, b"tail of a").unwrap();

    dev.move_object(&ctx, b, Domain::Vram).unwrap();
    assert!(dev.object_info(&ctx, a).unwrap().swapped_out);

    // Reading faults a back in, which pushes b out.
    let mut buf = [0u8; 9];
    dev.read(&ctx, a, 59 * BLOCK + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"tail of a");
    assert!(dev.object_info(&ctx, b).unwrap().swapped_out);

    let info = dev.object_info(&ctx, a).unwrap();
    assert!(!info.swapped_out);
    assert_eq!(info.cache_class, CacheClass::T2);
    assert_eq!(dev.stats().cache.free_blocks, 40);
}

#[test]
fn failed_exec_unpins_what_it_pinned() {
    let dev = device(10);
    let ctx = dev.open_context();
    let chan = dev.create_channel(Arc::new(SoftChannel::new()));
    let a = dev.create_object(&ctx, 6 * BLOCK).unwrap();
    let b = dev.create_object(&ctx, 6 * BLOCK).unwrap();

    assert!(matches!(
        dev.exec(&ctx, chan, &[a, b]),
        Err(MmError::OutOfMemory)
    ));
    let info = dev.object_info(&ctx, a).unwrap();
    assert_eq!(info.cache_class, CacheClass::T1);
    assert_eq!(info.last_seqno, 0);
    assert_eq!(dev.pending(chan).unwrap(), 0);

    assert!(matches!(
        dev.exec(&ctx, chan, &[a, a]),
        Err(MmError::InvalidArgument(_))
    ));
    assert!(matches!(
        dev.exec(&ctx, chan, &[a, 42]),
        Err(MmError::NotFound(_))
    ));
}

#[test]
fn active_objects_are_busy() {
    let dev = device(10);
    let ctx = dev.open_context();
    let chan = dev.create_channel(Arc::new(SoftChannel::new()));
    let a = dev.create_object(&ctx, BLOCK).unwrap();

    dev.exec(&ctx, chan, &[a]).unwrap();
    assert!(matches!(dev.exec(&ctx, chan, &[a]), Err(MmError::Busy)));
    assert!(matches!(
        dev.move_object(&ctx, a, Domain::Cpu),
        Err(MmError::Busy)
    ));
    let mut buf = [0u8; 4];
    assert!(matches!(
        dev.read(&ctx, a, 0, &mut buf),
        Err(MmError::Busy)
    ));
}

#[test]
fn poll_waits_for_the_retire_interval() {
    let (dev, clock) = manual_device(8);
    let ctx = dev.open_context();
    let hw = Arc::new(SoftChannel::new());
    let chan = dev.create_channel(hw.clone());
    let a = dev.create_object(&ctx, BLOCK).unwrap();

    dev.exec(&ctx, chan, &[a]).unwrap();
    hw.complete_all();

    assert_eq!(dev.poll().unwrap(), 0);
    assert_eq!(dev.pending(chan).unwrap(), 1);

    clock.advance(dev.config().retire_interval);
    assert_eq!(dev.poll().unwrap(), 1);
    assert_eq!(dev.pending(chan).unwrap(), 0);
    assert_eq!(dev.object_info(&ctx, a).unwrap().last_seqno, 0);

    // Nothing left to poll for.
    clock.advance(Duration::from_secs(10));
    assert_eq!(dev.poll().unwrap(), 0);
}

#[test]
fn deleted_handle_outlives_its_gpu_work() {
    let dev = device(8);
    let ctx = dev.open_context();
    let hw = Arc::new(SoftChannel::new());
    let chan = dev.create_channel(hw.clone());
    let a = dev.create_object(&ctx, 2 * BLOCK).unwrap();

    dev.exec(&ctx, chan, &[a]).unwrap();
    dev.delete_handle(&ctx, a).unwrap();
    assert_eq!(dev.stats().object_count, 1);
    assert_eq!(dev.stats().cache.pinned_blocks, 2);

    hw.complete_all();
    dev.retire(chan).unwrap();
    assert_eq!(dev.stats().object_count, 0);
    assert_eq!(dev.stats().cache.free_blocks, 8);
}

#[test]
fn destroying_a_channel_drops_its_pins() {
    let dev = device(8);
    let ctx = dev.open_context();
    let chan = dev.create_channel(Arc::new(SoftChannel::new()));
    let a = dev.create_object(&ctx, BLOCK).unwrap();

    dev.exec(&ctx, chan, &[a]).unwrap();
    assert_eq!(dev.destroy_channel(chan).unwrap(), 1);

    let info = dev.object_info(&ctx, a).unwrap();
    assert_eq!(info.last_seqno, 0);
    assert_eq!(info.cache_class, CacheClass::T1);
    assert!(matches!(dev.pending(chan), Err(MmError::NotFound(_))));
    assert!(matches!(dev.destroy_channel(chan), Err(MmError::NotFound(_))));
}

#[test]
fn channel_mapping_places_and_binds() {
    let dev = device(8);
    let ctx = dev.open_context();
    let chan = dev.create_channel(Arc::new(SoftChannel::new()));
    let a = dev.create_object(&ctx, BLOCK).unwrap();

    assert!(matches!(
        dev.chan_map(&ctx, a, ChannelId(99), 0x1000, 0),
        Err(MmError::NotFound(_))
    ));

    let placement = dev.chan_map(&ctx, a, chan, 0x20_0000, 0x7a00).unwrap();
    assert_eq!(placement.domain, Domain::Vram);

    let binding = dev.object_info(&ctx, a).unwrap().binding.unwrap();
    assert_eq!(binding.channel, chan);
    assert_eq!(binding.gpu_va, 0x20_0000);
    assert_eq!(binding.tile_flags, 0x7a00);

    dev.chan_unmap(&ctx, a).unwrap();
    assert_eq!(dev.object_info(&ctx, a).unwrap().binding, None);
}

#[test]
fn closing_a_context_releases_its_objects() {
    let dev = device(32);
    let ctx = dev.open_context();
    for _ in 0..3 {
        let h = dev.create_object(&ctx, 4 * BLOCK).unwrap();
        dev.move_object(&ctx, h, Domain::Vram).unwrap();
    }
    assert_eq!(dev.stats().cache.free_blocks, 20);

    assert_eq!(dev.close_context(ctx), 3);
    let stats = dev.stats();
    assert_eq!(stats.object_count, 0);
    assert_eq!(stats.cache.objects, 0);
    assert_eq!(stats.cache.free_blocks, 32);
}

#[test]
fn background_worker_retires_completed_work() {
    let dev = Arc::new(
        DeviceBuilder::new(8)
            .with_retire_interval(Duration::from_millis(2))
            .build()
            .unwrap(),
    );
    let ctx = dev.open_context();
    let hw = Arc::new(SoftChannel::new());
    let chan = dev.create_channel(hw.clone());
    let a = dev.create_object(&ctx, BLOCK).unwrap();

    let worker = dev.start_retire_worker().unwrap();
    dev.exec(&ctx, chan, &[a]).unwrap();
    hw.complete_all();

    let deadline = Instant::now() + Duration::from_secs(5);
    while dev.pending(chan).unwrap() > 0 {
        assert!(Instant::now() < deadline, "worker never retired the request");
        std::thread::sleep(Duration::from_millis(1));
    }
    drop(worker);
    assert_eq!(dev.object_info(&ctx, a).unwrap().last_seqno, 0);
}
