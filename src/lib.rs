pub mod directory;
pub mod framing;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod storage;
pub mod utils;
