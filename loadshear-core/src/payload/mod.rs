pub mod counter;
pub mod descriptor;
pub mod manager;

pub use counter::PayloadCounter;
pub use descriptor::{Endian, PacketOperation, PayloadDescriptor, TimeUnit};
pub use manager::{PayloadManager, PreparedPayload, Slice};
