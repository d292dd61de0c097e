pub mod rss;
pub mod scorer;

pub use rss::RssFeed;
pub use scorer::NewsScorer;
