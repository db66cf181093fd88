/// Bluetooth side of the hub: radio access, discovery, connections and
/// payload decoding
pub mod bluez;
pub mod connection;
pub mod decoder;
pub mod radio;
pub mod scanner;
