pub mod adapter;
pub mod paper;

pub use adapter::{Quote, RequestAction, TradeRequest, TradeResponse, Venue, VenueError};
pub use paper::PaperVenue;
