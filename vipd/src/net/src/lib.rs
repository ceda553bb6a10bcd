pub mod addr;
pub mod advertiser;
pub mod arp;
pub mod bgp;
pub mod error;
pub mod link;
pub mod mock;
pub mod ndp;
pub mod route;

pub use addr::AddressManager;
pub use advertiser::Advertiser;
pub use error::Error;
