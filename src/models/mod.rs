mod analytics;
mod notification;
mod spot;

pub use analytics::{AnalyticsDelta, AnalyticsSummary};
pub use notification::Notification;
pub use spot::{LotSnapshot, Spot};
