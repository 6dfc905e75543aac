//! Scripted in-memory collaborators for tests and dry runs. No real
//! browser or reasoning service is ever reached from here.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

use crate::drivers::{
    ActReport, BrowserDriver, DriverError, ReasonerError, ReasoningService, TabInfo,
};

/// In-memory browser with one initial blank tab. Deterministic
/// selectors succeed only when registered up front; `act` and
/// `extract` replay queued results in order.
pub struct ScriptedBrowser {
    tabs: Mutex<Vec<TabInfo>>,
    selectors: Mutex<HashSet<String>>,
    act_results: Mutex<VecDeque<ActReport>>,
    default_act: Mutex<Option<ActReport>>,
    extract_results: Mutex<VecDeque<Value>>,
    history: Mutex<Vec<String>>,
}

impl Default for ScriptedBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self {
            tabs: Mutex::new(vec![TabInfo {
                id: "tab-0".into(),
                url: "about:blank".into(),
                title: "blank".into(),
                active: true,
            }]),
            selectors: Mutex::new(HashSet::new()),
            act_results: Mutex::new(VecDeque::new()),
            default_act: Mutex::new(None),
            extract_results: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Register a selector that click/type/exists checks will find.
    pub fn with_selector(self, selector: impl Into<String>) -> Self {
        self.selectors.lock().insert(selector.into());
        self
    }

    /// Queue one `act` outcome; queued outcomes replay in order.
    pub fn with_act_result(self, report: ActReport) -> Self {
        self.act_results.lock().push_back(report);
        self
    }

    /// Outcome returned by `act` once the queue is drained.
    pub fn with_default_act(self, report: ActReport) -> Self {
        *self.default_act.lock() = Some(report);
        self
    }

    /// Queue one `extract` result; drained queue yields `null`.
    pub fn with_extract_result(self, value: Value) -> Self {
        self.extract_results.lock().push_back(value);
        self
    }

    /// URL of the active tab.
    pub fn current_url(&self) -> String {
        let tabs = self.tabs.lock();
        tabs.iter()
            .find(|t| t.active)
            .map(|t| t.url.clone())
            .unwrap_or_default()
    }

    /// Visited URLs, oldest first.
    pub fn visited(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    fn require_selector(&self, selector: &str) -> Result<(), DriverError> {
        if self.selectors.lock().contains(selector) {
            Ok(())
        } else {
            Err(DriverError::ElementNotFound(selector.to_string()))
        }
    }
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let mut tabs = self.tabs.lock();
        if let Some(active) = tabs.iter_mut().find(|t| t.active) {
            active.url = url.to_string();
        }
        self.history.lock().push(url.to_string());
        Ok(())
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn go_forward(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn refresh(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        // A 1x1 placeholder is enough for provenance tests.
        Ok(vec![0u8; 4])
    }

    async fn press_key(&self, _key: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn open_tab(&self, url: Option<&str>) -> Result<TabInfo, DriverError> {
        let mut tabs = self.tabs.lock();
        let tab = TabInfo {
            id: format!("tab-{}", tabs.len()),
            url: url.unwrap_or("about:blank").to_string(),
            title: String::new(),
            active: false,
        };
        tabs.push(tab.clone());
        Ok(tab)
    }

    async fn switch_tab(&self, tab_id: &str) -> Result<(), DriverError> {
        let mut tabs = self.tabs.lock();
        if !tabs.iter().any(|t| t.id == tab_id) {
            return Err(DriverError::TabNotFound(tab_id.to_string()));
        }
        for tab in tabs.iter_mut() {
            tab.active = tab.id == tab_id;
        }
        Ok(())
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, DriverError> {
        Ok(self.tabs.lock().clone())
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.require_selector(selector)
    }

    async fn type_text(&self, selector: &str, _text: &str) -> Result<(), DriverError> {
        self.require_selector(selector)
    }

    async fn element_exists(&self, selector: &str) -> Result<bool, DriverError> {
        Ok(self.selectors.lock().contains(selector))
    }

    async fn act(&self, _instruction: &str) -> Result<ActReport, DriverError> {
        if let Some(report) = self.act_results.lock().pop_front() {
            return Ok(report);
        }
        if let Some(report) = self.default_act.lock().clone() {
            return Ok(report);
        }
        Ok(ActReport {
            success: true,
            description: "done".into(),
        })
    }

    async fn extract(&self, _instruction: &str, _shape: &Value) -> Result<Value, DriverError> {
        Ok(self.extract_results.lock().pop_front().unwrap_or(Value::Null))
    }
}

/// Reasoning service that replays queued responses, then `"null"`.
pub struct ScriptedReasoner {
    responses: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedReasoner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.responses.lock().push_back(response.into());
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().push_back(response.into());
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoner {
    async fn complete(
        &self,
        prompt: &str,
        _input: &Value,
        _shape: Option<&Value>,
    ) -> Result<String, ReasonerError> {
        self.calls.lock().push(prompt.to_string());
        Ok(self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| "null".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn browser_starts_with_one_active_tab() {
        let browser = ScriptedBrowser::new();
        let tabs = browser.list_tabs().await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert!(tabs[0].active);
    }

    #[tokio::test]
    async fn act_queue_then_default() {
        let browser = ScriptedBrowser::new()
            .with_act_result(ActReport {
                success: false,
                description: "first".into(),
            })
            .with_default_act(ActReport {
                success: true,
                description: "fallback".into(),
            });
        assert!(!browser.act("x").await.unwrap().success);
        assert_eq!(browser.act("x").await.unwrap().description, "fallback");
        assert_eq!(browser.act("x").await.unwrap().description, "fallback");
    }

    #[tokio::test]
    async fn reasoner_replays_then_nulls() {
        let reasoner = ScriptedReasoner::new().with_response("42");
        let v = Value::Null;
        assert_eq!(reasoner.complete("p1", &v, None).await.unwrap(), "42");
        assert_eq!(reasoner.complete("p2", &v, None).await.unwrap(), "null");
        assert_eq!(reasoner.prompts(), vec!["p1", "p2"]);
    }
}
