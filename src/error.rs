use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Out of VRAM blocks")]
    OutOfMemory,

    #[error("Object is busy")]
    Busy,

    #[error("Range allocator exhausted despite {0} free blocks")]
    Exhausted(u32),
}

// A convenient alias
pub type MmResult<T> = Result<T, MmError>;
