pub mod pool;
pub mod scrapyd;

pub use pool::HttpAgentPool;
pub use scrapyd::{parse_agent_time, ScrapydAgent};
