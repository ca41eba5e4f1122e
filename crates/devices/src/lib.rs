//! Baseboard device models: PCI config plumbing, the host bridge that owns
//! shadow RAM and SMRAM remapping, and the legacy/native IDE controller.

pub mod hostbridge;
pub mod ide;
pub mod pci;

pub use hostbridge::HostBridge;
pub use ide::IdeController;
