//! Web search and single-page scraping.
//!
//! Provider selection is environment-driven: `FIRECRAWL_API_KEY` wins when
//! present, otherwise Tavily.  A search that reaches the provider and comes
//! back empty is still a *successful* tool call; the report carries a
//! `[Zero Results]` diagnostic the model can react to, which is different
//! from a transport or configuration failure.

use std::env;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::bridge::ToolsBridge;
use crate::{Tool, ToolArgs, ToolParam, ToolResult, ToolSpec, arg_str, arg_string_list, arg_usize};

pub const TAVILY_API_KEY_ENV: &str = "TAVILY_API_KEY";
pub const FIRECRAWL_API_KEY_ENV: &str = "FIRECRAWL_API_KEY";

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
const FIRECRAWL_SEARCH_URL: &str = "https://api.firecrawl.dev/v1/search";
const FIRECRAWL_SCRAPE_URL: &str = "https://api.firecrawl.dev/v1/scrape";

const SCRAPE_MAX_CHARS: usize = 5_000;
const SNIPPET_MAX_CHARS: usize = 200;

// ── web_search ───────────────────────────────────────────────────────────────

pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".to_string(),
            description:
                "Search the web with layered fallback queries, dedup, and provider auto-selection."
                    .to_string(),
            params: vec![
                ToolParam::required("query", "Primary search query"),
                ToolParam::optional("max_results", "Maximum results per query (default: 5)"),
                ToolParam::optional("provider", "auto | firecrawl | tavily (default: auto)"),
                ToolParam::optional(
                    "fallback_queries",
                    "Queries tried in order when the primary one comes back thin",
                ),
                ToolParam::optional("min_results", "Minimum non-empty report lines (default: 1)"),
            ],
        }
    }

    async fn call(&self, bridge: &ToolsBridge, args: &ToolArgs) -> ToolResult {
        let Some(query) = arg_str(args, "query").filter(|q| !q.trim().is_empty()) else {
            return ToolResult::fail("web_search missing required arg: query");
        };
        let max_results = arg_usize(args, "max_results", 5);
        let min_results = arg_usize(args, "min_results", 1).max(1);
        let provider = arg_str(args, "provider").unwrap_or("auto").to_ascii_lowercase();

        let mut queries = vec![query.to_string()];
        queries.extend(arg_string_list(args, "fallback_queries"));

        let mut attempts: Vec<String> = Vec::new();
        for (idx, q) in queries.iter().enumerate() {
            let selected = select_provider(&provider);
            debug!(attempt = idx + 1, provider = selected, query = %q, "web search attempt");

            let result = match selected {
                "firecrawl" => search_firecrawl(bridge, q, max_results).await,
                _ => search_tavily(bridge, q, max_results).await,
            };
            let output = match result {
                Ok(output) => output,
                Err(error) => return ToolResult::fail(error),
            };

            attempts.push(format!("[Attempt {}] query: {q}\n{output}", idx + 1));

            let non_empty_lines = output.lines().filter(|line| !line.trim().is_empty()).count();
            if non_empty_lines >= min_results {
                return ToolResult::ok(attempts.join("\n\n"));
            }
        }

        // Every query came back thin; still a successful call with the full
        // attempt trail so the model can pick a different angle.
        ToolResult::ok(attempts.join("\n\n"))
    }
}

fn select_provider(requested: &str) -> &'static str {
    match requested {
        "firecrawl" => "firecrawl",
        "tavily" => "tavily",
        _ => {
            if env_key(FIRECRAWL_API_KEY_ENV).is_some() {
                "firecrawl"
            } else {
                "tavily"
            }
        }
    }
}

fn env_key(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

async fn search_tavily(bridge: &ToolsBridge, query: &str, max_results: usize) -> Result<String, String> {
    let Some(api_key) = env_key(TAVILY_API_KEY_ENV) else {
        return Err("Tavily not available. Check TAVILY_API_KEY.".to_string());
    };

    let response = bridge
        .http()
        .post(TAVILY_SEARCH_URL)
        .json(&json!({ "api_key": api_key, "query": query, "max_results": max_results }))
        .send()
        .await
        .map_err(|err| format!("Tavily API Error: {err}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Tavily API Error: HTTP {status}: {body}"));
    }

    let body: serde_json::Value =
        response.json().await.map_err(|err| format!("Tavily API Error: {err}"))?;
    let items = collect_items(body.get("results"), "content");
    Ok(render_report("Tavily", query, items))
}

async fn search_firecrawl(
    bridge: &ToolsBridge,
    query: &str,
    limit: usize,
) -> Result<String, String> {
    let Some(api_key) = env_key(FIRECRAWL_API_KEY_ENV) else {
        return Err("Firecrawl config error: FIRECRAWL_API_KEY is not set".to_string());
    };

    let response = bridge
        .http()
        .post(FIRECRAWL_SEARCH_URL)
        .bearer_auth(api_key)
        .json(&json!({ "query": query, "limit": limit }))
        .send()
        .await
        .map_err(|err| format!("Firecrawl API Error: {err}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Firecrawl API Error: HTTP {status}: {body}"));
    }

    let body: serde_json::Value =
        response.json().await.map_err(|err| format!("Firecrawl API Error: {err}"))?;
    if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
        return Err(format!(
            "Firecrawl API returned error: {}",
            body.get("error").and_then(|v| v.as_str()).unwrap_or("unknown")
        ));
    }
    let items = collect_items(body.get("data"), "description");
    Ok(render_report("Firecrawl", query, items))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SearchItem {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn collect_items(raw: Option<&serde_json::Value>, snippet_key: &str) -> Vec<SearchItem> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| SearchItem {
            title: item.get("title").and_then(|v| v.as_str()).unwrap_or("No title").to_string(),
            url: item.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            snippet: item
                .get(snippet_key)
                .or_else(|| item.get("markdown"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .chars()
                .take(SNIPPET_MAX_CHARS)
                .collect(),
        })
        .collect()
}

/// Sort by URL, dedup by lowercased (url, title), number the survivors.
/// Zero survivors produce the `[Zero Results]` diagnostic.
pub(crate) fn render_report(provider: &str, query: &str, mut items: Vec<SearchItem>) -> String {
    items.sort_by(|a, b| a.url.cmp(&b.url));
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut index = 0;
    for item in items {
        let key = (item.url.trim().to_lowercase(), item.title.trim().to_lowercase());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        index += 1;
        lines.push(format!("{index}. {}", item.title));
        lines.push(format!("   URL: {}", item.url));
        lines.push(format!("   {}", item.snippet));
    }

    if lines.is_empty() {
        return format!(
            "[Zero Results] {provider} API responded successfully but returned no results for query: '{query}'\n\
             Possible reasons: query too specific, topic too niche, or no indexed content matches.\n\
             Suggestions: try broader keywords, different phrasing, or alternative search terms."
        );
    }
    lines.join("\n")
}

// ── web_scrape ───────────────────────────────────────────────────────────────

pub struct WebScrapeTool;

#[async_trait]
impl Tool for WebScrapeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_scrape".to_string(),
            description: "Extract a single web page as markdown (Firecrawl).".to_string(),
            params: vec![
                ToolParam::required("url", "Page URL to scrape"),
                ToolParam::optional("format", "Output format, markdown only (default: markdown)"),
            ],
        }
    }

    async fn call(&self, bridge: &ToolsBridge, args: &ToolArgs) -> ToolResult {
        let Some(url) = arg_str(args, "url").filter(|u| !u.trim().is_empty()) else {
            return ToolResult::fail("web_scrape missing required arg: url");
        };
        let Some(api_key) = env_key(FIRECRAWL_API_KEY_ENV) else {
            return ToolResult::fail(
                "Firecrawl config error: FIRECRAWL_API_KEY is not set. Set FIRECRAWL_API_KEY.",
            );
        };

        // Markdown is forced regardless of the requested format; structured
        // JSON output makes downstream parsing brittle.
        let response = match bridge
            .http()
            .post(FIRECRAWL_SCRAPE_URL)
            .bearer_auth(api_key)
            .json(&json!({ "url": url, "formats": ["markdown"] }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return ToolResult::fail(format!("Firecrawl scrape error: {err}")),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return ToolResult::fail(format!("Firecrawl scrape error: HTTP {status}: {body}"));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(err) => return ToolResult::fail(format!("Firecrawl scrape error: {err}")),
        };
        if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return ToolResult::fail(format!(
                "Firecrawl scrape returned error: {}",
                body.get("error").and_then(|v| v.as_str()).unwrap_or("unknown")
            ));
        }

        // `data` is an object for single-URL scrapes; tolerate an array too.
        let data = match body.get("data") {
            Some(serde_json::Value::Array(items)) => items.first().cloned(),
            Some(other) if other.is_object() => Some(other.clone()),
            _ => None,
        };
        let Some(data) = data else {
            return ToolResult::ok(format!(
                "[No Data] Firecrawl returned empty data for '{url}'.\n\
                 The page may be inaccessible, blocked, or have no extractable content."
            ));
        };

        let content = data
            .get("markdown")
            .or_else(|| data.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if content.trim().is_empty() {
            return ToolResult::ok(format!(
                "[Empty Content] Firecrawl successfully accessed '{url}' but extracted no text content.\n\
                 Possible reasons: page requires JavaScript rendering, content behind login, \
                 anti-scraping protection, or page is mostly images/media.\n\
                 Suggestions: try a different URL, or use web_search to find alternative sources."
            ));
        }

        let title = data
            .get("metadata")
            .and_then(|m| m.get("title"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let output = if title.is_empty() {
            content.to_string()
        } else {
            format!("Title: {title}\n\n{content}")
        };
        ToolResult::ok(truncate_chars(&output, SCRAPE_MAX_CHARS))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, url: &str, snippet: &str) -> SearchItem {
        SearchItem { title: title.to_string(), url: url.to_string(), snippet: snippet.to_string() }
    }

    #[test]
    fn report_sorts_by_url_and_numbers() {
        let report = render_report(
            "Tavily",
            "rust",
            vec![item("B", "https://b.example", "second"), item("A", "https://a.example", "first")],
        );
        let a_pos = report.find("1. A").unwrap();
        let b_pos = report.find("2. B").unwrap();
        assert!(a_pos < b_pos);
        assert!(report.contains("   URL: https://a.example"));
    }

    #[test]
    fn report_dedups_case_insensitively() {
        let report = render_report(
            "Tavily",
            "rust",
            vec![
                item("Rust Lang", "https://rust-lang.org", "x"),
                item("RUST LANG", "HTTPS://RUST-LANG.ORG", "y"),
            ],
        );
        assert_eq!(report.matches("URL:").count(), 1);
    }

    #[test]
    fn empty_report_is_zero_results_diagnostic() {
        let report = render_report("Tavily", "obscure thing", vec![]);
        assert!(report.starts_with("[Zero Results]"));
        assert!(report.contains("'obscure thing'"));
    }

    #[test]
    fn provider_selection_honors_explicit_request() {
        assert_eq!(select_provider("firecrawl"), "firecrawl");
        assert_eq!(select_provider("tavily"), "tavily");
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let text = "参".repeat(SCRAPE_MAX_CHARS + 10);
        assert_eq!(truncate_chars(&text, SCRAPE_MAX_CHARS).chars().count(), SCRAPE_MAX_CHARS);
    }

    #[tokio::test]
    async fn missing_query_fails_fast() {
        let bridge = ToolsBridge::default();
        let result = WebSearchTool.call(&bridge, &ToolArgs::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("query"));
    }
}
