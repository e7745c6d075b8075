pub mod address;
pub mod bidir_socket;
mod operations;
pub mod pktinfo;
pub mod socket;
