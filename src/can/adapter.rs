//! Convenience functions to get a CAN adapter.

/// Convenience function to get the first available panda on the system, USB or SPI, wrapped as an async adapter.
pub fn get_adapter() -> Result<crate::can::AsyncCanAdapter, crate::error::Error> {
    crate::panda::Panda::new_async()
}
