mod core;
mod helpers;
mod init;
mod io;


pub use self::core::{
    CapacityClass, CardGeneration, ClockMode, SdEngine, SdError, SdErrorKind, SessionInfo,
    SessionState, SD_SECTOR_SIZE,
};
