//! 工具层：Tool 契约与注册表、带超时与审计的执行器、内置交互工具、参数 schema、元素定位

pub mod browser;
pub mod echo;
pub mod executor;
pub mod locator;
pub mod registry;
pub mod schema;

pub use browser::{register_browser_tools, BrowserSession, PageElement};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use locator::{ElementLocator, KeywordElementLocator, LlmElementLocator};
pub use registry::{Tool, ToolDescriptor, ToolOutcome, ToolRegistry};
pub use schema::tool_call_schema_json;
