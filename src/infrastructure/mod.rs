pub mod bluetooth;
pub mod card;
pub mod logging;
pub mod protocol;
pub mod serial;
