//! Protocol module - printer class and spooler wire definitions.

pub mod constants;
pub mod device_id;
pub mod sidechannel;

pub use constants::*;
pub use device_id::{DeviceId, DeviceIdError, decode_device_id, make_device_uri};
pub use sidechannel::{SideChannelError, SideCommand, SideReply, SideRequest, SideStatus};
