pub mod cmd;
pub mod loopdev;
pub mod mount;
