pub mod feed;
pub mod staff;
pub mod worker;
