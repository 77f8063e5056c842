pub mod bo;
pub mod cache;
pub mod device;
pub mod fence;
pub mod gem;
pub mod idr;
