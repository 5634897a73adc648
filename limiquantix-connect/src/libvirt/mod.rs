//! Libvirt hypervisor driver.
//!
//! Connects to libvirtd through the `virt` crate. It requires the `libvirt`
//! feature to be enabled and the system to have libvirt installed.

#[cfg(feature = "libvirt")]
mod driver;
#[cfg(feature = "libvirt")]
mod poller;

#[cfg(feature = "libvirt")]
pub use driver::{LibvirtDriver, LibvirtSession};
