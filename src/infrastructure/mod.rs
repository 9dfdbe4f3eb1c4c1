pub mod adapter;
#[cfg(feature = "btleplug-adapter")]
pub mod btle;
pub mod logging;
