//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the five mail tools.
//! Every well-formed call yields a text result; failures are flagged as tool
//! errors rather than surfaced as protocol faults.

use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use tracing::debug;

use crate::config::MailConfig;
use crate::errors::AppResult;
use crate::imap::ImapConnector;
use crate::models::{
    CountDailyEmailsInput, GetEmailContentInput, SearchEmailsInput, SendEmailInput,
};
use crate::smtp::SmtpSubmitter;
use crate::tools::{MailTools, ToolReply};

/// Email MCP server
///
/// Holds the tool dispatcher for the configured account. Implements MCP tool
/// handlers via `#[tool]` attribute macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct MailToolsServer {
    tools: Arc<MailTools>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailToolsServer {
    /// Create a server talking to the real IMAP and SMTP services
    ///
    /// No connection is opened here; each tool call connects on its own.
    pub fn new(config: MailConfig) -> AppResult<Self> {
        let config = Arc::new(config);
        let submitter = SmtpSubmitter::new(&config)?;
        let factory = ImapConnector::new(Arc::clone(&config));
        Ok(Self::with_tools(MailTools::new(
            config,
            Arc::new(factory),
            Arc::new(submitter),
        )))
    }

    fn with_tools(tools: MailTools) -> Self {
        Self {
            tools: Arc::new(tools),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "list-folders",
        description = "List all available email folders/mailboxes in the account"
    )]
    async fn list_folders(&self) -> Result<CallToolResult, ErrorData> {
        let started = Instant::now();
        Ok(finalize_tool("list-folders", started, self.tools.list_folders().await))
    }

    #[tool(
        name = "search-emails",
        description = "Search emails within a date range and/or with specific keywords in a folder (defaults to the last 7 days in inbox)"
    )]
    async fn search_emails(
        &self,
        Parameters(input): Parameters<SearchEmailsInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let started = Instant::now();
        Ok(finalize_tool(
            "search-emails",
            started,
            self.tools.search_emails(input).await,
        ))
    }

    #[tool(
        name = "get-email-content",
        description = "Get the full content of a specific email by its ID"
    )]
    async fn get_email_content(
        &self,
        Parameters(input): Parameters<GetEmailContentInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let started = Instant::now();
        Ok(finalize_tool(
            "get-email-content",
            started,
            self.tools.get_email_content(input).await,
        ))
    }

    #[tool(
        name = "count-daily-emails",
        description = "Count emails received for each day in a date range"
    )]
    async fn count_daily_emails(
        &self,
        Parameters(input): Parameters<CountDailyEmailsInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let started = Instant::now();
        Ok(finalize_tool(
            "count-daily-emails",
            started,
            self.tools.count_daily_emails(input).await,
        ))
    }

    /// Only call after the user has confirmed recipients, subject and content
    #[tool(
        name = "send-email",
        description = "CONFIRMATION STEP: Actually send the email after user confirms the details. Before calling this, first show the email details to the user for confirmation. Required fields: recipients (to), subject, and content. Optional: CC recipients."
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let started = Instant::now();
        Ok(finalize_tool(
            "send-email",
            started,
            self.tools.send_email(input).await,
        ))
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailToolsServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Email tools over IMAP/SMTP: list folders, search, read and count messages, and send mail. Always confirm recipients, subject and content with the user before calling send-email.",
        )
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Wrap a tool reply as a text result, flagging failures as tool errors
fn finalize_tool(tool: &'static str, started: Instant, reply: ToolReply) -> CallToolResult {
    debug!(
        tool,
        is_error = reply.is_error,
        duration_ms = duration_ms(started),
        "tool call finished"
    );
    let content = vec![Content::text(reply.text)];
    if reply.is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    }
}
