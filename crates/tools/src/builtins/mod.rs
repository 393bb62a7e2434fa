//! Built-in tools: web search, web scrape, code interpreter, calculator.

mod calculate;
mod interpreter;
mod web;

pub use calculate::CalculateTool;
pub use interpreter::CodeInterpreterTool;
pub use web::{FIRECRAWL_API_KEY_ENV, TAVILY_API_KEY_ENV, WebScrapeTool, WebSearchTool};
