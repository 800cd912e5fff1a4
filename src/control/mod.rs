//! Named camera controls: vocabulary, capability descriptors and the
//! validated get/set path.

pub mod property;
pub mod table;

pub use property::{MenuOption, Property, PropertyDescriptor, PropertyKind};
pub use table::{ControlInfo, PropertyTable};
