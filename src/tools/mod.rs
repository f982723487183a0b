pub mod search;

pub use search::{format_results_for_context, SearchOutcome, SearchResult, WebSearchClient};
