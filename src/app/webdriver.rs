use std::time::Duration;

use serde_json::{Value, json};
use url::Url;

use super::config::BrowserKind;
use super::error::WebDriverError;

/// W3C key under which element references travel on the wire.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

impl ElementRef {
    fn to_wire(&self) -> Value {
        json!({ ELEMENT_KEY: self.0 })
    }

    pub fn from_wire(value: &Value) -> Option<Self> {
        value
            .get(ELEMENT_KEY)
            .and_then(|v| v.as_str())
            .map(|id| ElementRef(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverClient {
    http: reqwest::Client,
    endpoint: String,
}

impl WebDriverClient {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, WebDriverError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| WebDriverError::Transport {
                op: "client build",
                source,
            })?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn create_session(
        &self,
        browser: BrowserKind,
        headless: bool,
    ) -> Result<String, WebDriverError> {
        let caps = webdriver_capabilities(browser, headless);
        let request = self
            .http
            .post(format!("{}/session", self.endpoint))
            .json(&caps);
        let (value, body) = send("session create", request).await?;
        value
            .pointer("/value/sessionId")
            .and_then(|v| v.as_str())
            .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .ok_or_else(|| WebDriverError::Payload {
                op: "session create",
                body: truncate_for_log(&body, 220),
            })
    }

    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<(), WebDriverError> {
        let request = self
            .http
            .post(format!("{}/session/{}/url", self.endpoint, session_id))
            .json(&json!({ "url": url }));
        send("navigate", request).await.map(|_| ())
    }

    pub async fn execute(
        &self,
        session_id: &str,
        script: &str,
        args: Vec<Value>,
    ) -> Result<Value, WebDriverError> {
        let request = self
            .http
            .post(format!(
                "{}/session/{}/execute/sync",
                self.endpoint, session_id
            ))
            .json(&json!({ "script": script, "args": args }));
        let (mut value, _) = send("execute script", request).await?;
        Ok(value
            .get_mut("value")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    pub async fn execute_on(
        &self,
        session_id: &str,
        script: &str,
        element: &ElementRef,
    ) -> Result<Value, WebDriverError> {
        self.execute(session_id, script, vec![element.to_wire()]).await
    }

    /// Moves the pointer onto the element's centre, which fires pointerenter/mouseover.
    pub async fn hover(&self, session_id: &str, element: &ElementRef) -> Result<(), WebDriverError> {
        let actions = json!({
            "actions": [{
                "type": "pointer",
                "id": "harvest-mouse",
                "parameters": { "pointerType": "mouse" },
                "actions": [
                    { "type": "pointerMove", "duration": 0, "origin": element.to_wire(), "x": 0, "y": 0 }
                ]
            }]
        });
        let request = self
            .http
            .post(format!("{}/session/{}/actions", self.endpoint, session_id))
            .json(&actions);
        send("pointer hover", request).await.map(|_| ())
    }

    pub async fn click(&self, session_id: &str, element: &ElementRef) -> Result<(), WebDriverError> {
        let request = self
            .http
            .post(format!(
                "{}/session/{}/element/{}/click",
                self.endpoint, session_id, element.0
            ))
            .json(&json!({}));
        send("element click", request).await.map(|_| ())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), WebDriverError> {
        let request = self
            .http
            .delete(format!("{}/session/{}", self.endpoint, session_id));
        send("delete session", request).await.map(|_| ())
    }
}

async fn send(
    op: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<(Value, String), WebDriverError> {
    let res = request
        .send()
        .await
        .map_err(|source| WebDriverError::Transport { op, source })?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|source| WebDriverError::Transport { op, source })?;
    let value: Value = serde_json::from_str(&body).unwrap_or_default();
    if let Some(err) = protocol_error(op, &value) {
        return Err(err);
    }
    if !status.is_success() {
        return Err(WebDriverError::Status {
            op,
            status: status.as_u16(),
            body: truncate_for_log(&body, 240),
        });
    }
    Ok((value, body))
}

fn protocol_error(op: &'static str, value: &Value) -> Option<WebDriverError> {
    let err = value.pointer("/value/error").and_then(|v| v.as_str())?;
    let message = value
        .pointer("/value/message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown webdriver error");
    Some(WebDriverError::Protocol {
        op,
        error: err.to_string(),
        message: truncate_for_log(message, 240),
    })
}

pub fn webdriver_capabilities(browser: BrowserKind, headless: bool) -> Value {
    match browser {
        BrowserKind::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": {
                            "args": args,
                            "prefs": {
                                "browser.cache.disk.enable": false,
                                "browser.cache.memory.enable": false
                            }
                        }
                    }
                }
            })
        }
        BrowserKind::Edge => {
            let mut args = chromium_args(headless);
            args.push("--disable-blink-features=AutomationControlled".to_string());
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "MicrosoftEdge",
                        "acceptInsecureCerts": true,
                        "ms:edgeOptions": { "args": args }
                    }
                }
            })
        }
        BrowserKind::Chrome => {
            let mut args = chromium_args(headless);
            args.push("--disable-blink-features=AutomationControlled".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

fn chromium_args(headless: bool) -> Vec<String> {
    let mut args = Vec::<String>::new();
    if headless {
        args.push("--headless=new".to_string());
    }
    // Thumbnails outside the viewport ignore synthetic pointer events.
    args.push("--window-size=1920,1080".to_string());
    args.push("--disable-gpu".to_string());
    args.push("--disable-dev-shm-usage".to_string());
    args.push("--no-first-run".to_string());
    args.push("--no-default-browser-check".to_string());
    args
}

pub async fn endpoint_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    matches!(
        tokio::time::timeout(
            Duration::from_secs(2),
            tokio::net::TcpStream::connect((host, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_is_decoded_from_value_payload() {
        let payload = json!({
            "value": { "error": "no such element", "message": "Unable to locate element", "stacktrace": "" }
        });
        match protocol_error("element click", &payload) {
            Some(WebDriverError::Protocol { op, error, message }) => {
                assert_eq!(op, "element click");
                assert_eq!(error, "no such element");
                assert_eq!(message, "Unable to locate element");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(protocol_error("navigate", &json!({ "value": null })).is_none());
    }

    #[test]
    fn element_refs_round_trip_the_w3c_key() {
        let wire = json!({ ELEMENT_KEY: "abc-123" });
        let element = ElementRef::from_wire(&wire).expect("element");
        assert_eq!(element.0, "abc-123");
        assert_eq!(element.to_wire(), wire);
        assert!(ElementRef::from_wire(&json!({ "ELEMENT": "legacy" })).is_none());
    }

    #[test]
    fn chrome_capabilities_honour_headless_flag() {
        let caps = webdriver_capabilities(BrowserKind::Chrome, true);
        let args = caps
            .pointer("/capabilities/alwaysMatch/goog:chromeOptions/args")
            .and_then(|v| v.as_array())
            .expect("args");
        assert!(args.iter().any(|a| a == "--headless=new"));

        let caps = webdriver_capabilities(BrowserKind::Firefox, false);
        let args = caps
            .pointer("/capabilities/alwaysMatch/moz:firefoxOptions/args")
            .and_then(|v| v.as_array())
            .expect("args");
        assert!(args.is_empty());
    }

    #[test]
    fn long_bodies_are_truncated() {
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
        assert_eq!(truncate_for_log("abc", 3), "abc");
    }

    #[tokio::test]
    async fn malformed_endpoint_is_unreachable() {
        assert!(!endpoint_reachable("not a url").await);
    }
}
