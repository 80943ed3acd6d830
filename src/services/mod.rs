// Services for the OS Emulator
pub mod process_service;

pub use process_service::ProcessManager;
