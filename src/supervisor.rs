//! Process supervisor client (C3).
//!
//! Talks to a supervisord-style control channel over XML-RPC
//! (`stopProcess`, `startProcess`, `getProcessInfo`, §6 "Subprocess tooling").
//! No XML-RPC crate exists anywhere in the surrounding dependency corpus, so
//! this hand-rolls the minimal request/response shapes the three calls need
//! on top of `reqwest`, rather than fabricate a dependency — see DESIGN.md.

use crate::{Error, Result};

pub struct SupervisorClient {
    rpc_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub name: String,
    pub state_name: String,
    pub description: String,
}

impl SupervisorClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: &str, params: &[&str]) -> Result<String> {
        let body = build_method_call(method, params);
        let response = self
            .client
            .post(&self.rpc_url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::UpstreamTimeout
                } else {
                    Error::UpstreamUnreachable(format!("supervisor RPC unreachable: {e}"))
                }
            })?;
        let text = response.text().await?;
        if text.contains("<fault>") {
            return Err(Error::ToolFailure(format!(
                "supervisor RPC fault calling {method}: {}",
                extract_fault_string(&text).unwrap_or_else(|| text.clone())
            )));
        }
        Ok(text)
    }

    pub async fn stop_process(&self, name: &str) -> Result<()> {
        self.call("stopProcess", &[name]).await?;
        Ok(())
    }

    pub async fn start_process(&self, name: &str) -> Result<()> {
        self.call("startProcess", &[name]).await?;
        Ok(())
    }

    pub async fn get_process_info(&self, name: &str) -> Result<ProcessInfo> {
        let response = self.call("getProcessInfo", &[name]).await?;
        Ok(ProcessInfo {
            name: extract_member_string(&response, "name").unwrap_or_else(|| name.to_string()),
            state_name: extract_member_string(&response, "statename").unwrap_or_default(),
            description: extract_member_string(&response, "description").unwrap_or_default(),
        })
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn build_method_call(method: &str, params: &[&str]) -> String {
    let mut body = String::from("<?xml version=\"1.0\"?><methodCall>");
    body.push_str(&format!("<methodName>{method}</methodName>"));
    body.push_str("<params>");
    for param in params {
        body.push_str(&format!(
            "<param><value><string>{}</string></value></param>",
            xml_escape(param)
        ));
    }
    body.push_str("</params></methodCall>");
    body
}

/// Pulls `<member><name>KEY</name><value>...<string>VALUE</string>...</value></member>`
/// out of a `getProcessInfo` struct response. Good enough for the three
/// fields this client reads; not a general XML-RPC parser.
fn extract_member_string(xml: &str, key: &str) -> Option<String> {
    let marker = format!("<name>{key}</name>");
    let after_name = xml.find(&marker)? + marker.len();
    let value_start = xml[after_name..].find("<value>")? + after_name + "<value>".len();
    let value_end = xml[value_start..].find("</value>")? + value_start;
    let inner = &xml[value_start..value_end];
    let text = inner
        .trim_start_matches("<string>")
        .trim_end_matches("</string>")
        .trim();
    Some(text.to_string())
}

fn extract_fault_string(xml: &str) -> Option<String> {
    extract_member_string(xml, "faultString")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_well_formed_method_call() {
        let body = build_method_call("stopProcess", &["registry"]);
        assert!(body.contains("<methodName>stopProcess</methodName>"));
        assert!(body.contains("<string>registry</string>"));
    }

    #[test]
    fn escapes_special_characters_in_params() {
        let body = build_method_call("stopProcess", &["a&b<c>"]);
        assert!(body.contains("a&amp;b&lt;c&gt;"));
    }

    #[test]
    fn extracts_struct_members_from_a_process_info_response() {
        let xml = r#"<?xml version="1.0"?><methodResponse><params><param><value><struct>
            <member><name>name</name><value><string>registry</string></value></member>
            <member><name>statename</name><value><string>RUNNING</string></value></member>
        </struct></value></param></params></methodResponse>"#;
        assert_eq!(extract_member_string(xml, "name").as_deref(), Some("registry"));
        assert_eq!(extract_member_string(xml, "statename").as_deref(), Some("RUNNING"));
    }

    #[test]
    fn extracts_fault_string_from_a_fault_response() {
        let xml = r#"<?xml version="1.0"?><methodResponse><fault><value><struct>
            <member><name>faultCode</name><value><int>10</int></value></member>
            <member><name>faultString</name><value><string>BAD_NAME: nope</string></value></member>
        </struct></value></fault></methodResponse>"#;
        assert_eq!(extract_fault_string(xml).as_deref(), Some("BAD_NAME: nope"));
    }
}
