//! Seams to the stages after aggregation: prose summarization and delivery.
//!
//! The core only builds the summarizer's input. The pass-through
//! implementations here keep the binary usable without an LLM or a mail relay.

use async_trait::async_trait;

use crate::errors::DigestResult;
use crate::pipeline::RunResult;

/// Turns the concatenated reports into prose
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, context: &str) -> DigestResult<String>;
}

/// Delivers the summary to a human
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &str) -> DigestResult<()>;
}

/// Returns the reports unchanged
#[derive(Debug, Default)]
pub struct EchoSummarizer;

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, context: &str) -> DigestResult<String> {
        Ok(context.trim_start().to_string())
    }
}

/// Prints the summary to standard output
#[derive(Debug, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn notify(&self, summary: &str) -> DigestResult<()> {
        println!("\n--- Daily Cloud Logs Summary ---");
        println!("{summary}");
        Ok(())
    }
}

/// Every provider's report, each under a `--- {PROVIDER} FILTERED LOGS ---`
/// banner. Empty when no provider produced a report.
pub fn summary_context(result: &RunResult) -> String {
    let mut context = String::new();
    for report in result.reports() {
        context.push_str(&format!(
            "\n--- {} FILTERED LOGS ---\n{}",
            report.provider.display_name().to_uppercase(),
            report.render()
        ));
    }
    context
}
