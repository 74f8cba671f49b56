//! WS-Management envelopes for the windows shell resource and the bits of
//! the responses the client cares about.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use uuid::Uuid;

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

const MAX_ENVELOPE_SIZE: u32 = 153_600;
const OPERATION_TIMEOUT: &str = "PT60S";
const LOCALE: &str = "en-US";

/// WSManFault code for an operation timeout.
const FAULT_TIMED_OUT: &str = "2150858793";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("response has no {0}")]
    MissingElement(&'static str),
    #[error("invalid {stream} stream data: {source}")]
    InvalidStream {
        stream: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("invalid exit code {0:?}")]
    InvalidExitCode(String),
}

/// SOAP fault reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: String,
    pub reason: String,
}

impl Fault {
    /// The operation timed out without new output; the request may be repeated.
    pub fn is_timeout(&self) -> bool {
        self.code == FAULT_TIMED_OUT || self.code.ends_with("TimedOut")
    }
}

/// One Receive response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i32>,
}

struct Header<'a> {
    to: &'a str,
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
}

impl Header<'_> {
    fn render(&self) -> String {
        let mut header = format!(
            r#"<a:To>{to}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{RESOURCE_CMD}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:Locale xml:lang="{LOCALE}" s:mustUnderstand="false"/>
    <w:OperationTimeout>{OPERATION_TIMEOUT}</w:OperationTimeout>"#,
            to = xml_escape(self.to),
            action = self.action,
            id = Uuid::new_v4(),
        );

        if let Some(shell_id) = self.shell_id {
            header.push_str(&format!(
                r#"
    <w:SelectorSet>
      <w:Selector Name="ShellId">{}</w:Selector>
    </w:SelectorSet>"#,
                xml_escape(shell_id)
            ));
        }

        if !self.options.is_empty() {
            header.push_str("\n    <w:OptionSet>");
            for (name, value) in self.options {
                header.push_str(&format!(
                    "\n      <w:Option Name=\"{name}\">{}</w:Option>",
                    xml_escape(value)
                ));
            }
            header.push_str("\n    </w:OptionSet>");
        }

        header
    }
}

fn envelope(header: Header<'_>, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    {}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
        header.render()
    )
}

pub fn create_shell(to: &str) -> String {
    envelope(
        Header {
            to,
            action: ACTION_CREATE,
            shell_id: None,
            options: &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
        },
        "
    <rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>
  ",
    )
}

pub fn command(to: &str, shell_id: &str, command_line: &str) -> String {
    envelope(
        Header {
            to,
            action: ACTION_COMMAND,
            shell_id: Some(shell_id),
            options: &[
                ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
                ("WINRS_SKIP_CMD_SHELL", "FALSE"),
            ],
        },
        &format!(
            "
    <rsp:CommandLine>
      <rsp:Command>{}</rsp:Command>
    </rsp:CommandLine>
  ",
            xml_escape(command_line)
        ),
    )
}

pub fn receive(to: &str, shell_id: &str, command_id: &str) -> String {
    envelope(
        Header {
            to,
            action: ACTION_RECEIVE,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            r#"
    <rsp:Receive>
      <rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>
  "#,
            xml_escape(command_id)
        ),
    )
}

pub fn signal_terminate(to: &str, shell_id: &str, command_id: &str) -> String {
    envelope(
        Header {
            to,
            action: ACTION_SIGNAL,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            r#"
    <rsp:Signal CommandId="{}">
      <rsp:Code>{SIGNAL_TERMINATE}</rsp:Code>
    </rsp:Signal>
  "#,
            xml_escape(command_id)
        ),
    )
}

pub fn delete_shell(to: &str, shell_id: &str) -> String {
    envelope(
        Header {
            to,
            action: ACTION_DELETE,
            shell_id: Some(shell_id),
            options: &[],
        },
        "",
    )
}

/// `ShellId` from a Create response, falling back to the selector of the
/// returned endpoint reference.
pub fn parse_shell_id(xml: &str) -> Result<String, ParseError> {
    if let Some(id) = elements(xml, "ShellId").first() {
        return Ok(xml_unescape(id.text.trim()));
    }

    elements(xml, "Selector")
        .into_iter()
        .find(|selector| attribute(selector.attrs, "Name") == Some("ShellId"))
        .map(|selector| xml_unescape(selector.text.trim()))
        .ok_or(ParseError::MissingElement("ShellId"))
}

pub fn parse_command_id(xml: &str) -> Result<String, ParseError> {
    elements(xml, "CommandId")
        .first()
        .map(|id| xml_unescape(id.text.trim()))
        .ok_or(ParseError::MissingElement("CommandId"))
}

pub fn parse_receive(xml: &str) -> Result<ReceiveChunk, ParseError> {
    let mut chunk = ReceiveChunk::default();

    for stream in elements(xml, "Stream") {
        let name = attribute(stream.attrs, "Name").unwrap_or_default();
        let data: String = stream.text.chars().filter(|c| !c.is_whitespace()).collect();
        if data.is_empty() {
            continue;
        }

        let bytes = STANDARD
            .decode(data.as_bytes())
            .map_err(|source| ParseError::InvalidStream {
                stream: name.to_string(),
                source,
            })?;
        match name {
            "stdout" => chunk.stdout.extend_from_slice(&bytes),
            "stderr" => chunk.stderr.extend_from_slice(&bytes),
            _ => {}
        }
    }

    if let Some(state) = elements(xml, "CommandState").first() {
        chunk.done = attribute(state.attrs, "State") == Some(COMMAND_STATE_DONE);

        if let Some(code) = elements(state.text, "ExitCode").first() {
            let raw = code.text.trim();
            // unsigned DWORDs above i32::MAX come back as-is
            let value: i64 = raw
                .parse()
                .map_err(|_| ParseError::InvalidExitCode(raw.to_string()))?;
            chunk.exit_code = Some(value as i32);
        }
    }

    Ok(chunk)
}

/// Fault carried in the body, if any. The WSManFault code is preferred over
/// the SOAP subcode.
pub fn parse_fault(xml: &str) -> Option<Fault> {
    let fault = elements(xml, "Fault")
        .into_iter()
        .find(|fault| !fault.text.is_empty())?;

    let wsman = elements(fault.text, "WSManFault").into_iter().next();

    let code = wsman
        .as_ref()
        .and_then(|detail| attribute(detail.attrs, "Code"))
        .map(str::to_string)
        .or_else(|| {
            elements(fault.text, "Value")
                .last()
                .map(|value| value.text.trim().to_string())
        })
        .unwrap_or_default();

    let reason = wsman
        .as_ref()
        .and_then(|detail| elements(detail.text, "Message").into_iter().next())
        .or_else(|| elements(fault.text, "Text").into_iter().next())
        .map(|text| xml_unescape(text.text.trim()))
        .unwrap_or_default();

    Some(Fault { code, reason })
}

struct Element<'a> {
    attrs: &'a str,
    text: &'a str,
}

/// Every element with the given local name, regardless of prefix. Matches
/// are not searched for nested elements of the same name.
fn elements<'a>(xml: &'a str, name: &str) -> Vec<Element<'a>> {
    let mut found = Vec::new();
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        let tag = &rest[open + 1..];
        let Some(end) = tag.find('>') else { break };
        let head = &tag[..end];
        rest = &tag[end + 1..];

        if head.starts_with(['/', '?', '!']) {
            continue;
        }

        let self_closing = head.ends_with('/');
        let head = head.trim_end_matches('/');
        let (qname, attrs) = head
            .split_once(char::is_whitespace)
            .unwrap_or((head, ""));
        let local = qname.rsplit(':').next().unwrap_or(qname);
        if local != name {
            continue;
        }

        if self_closing {
            found.push(Element { attrs, text: "" });
            continue;
        }

        let close = format!("</{qname}>");
        let Some(stop) = rest.find(&close) else { break };
        found.push(Element {
            attrs,
            text: &rest[..stop],
        });
        rest = &rest[stop + close.len()..];
    }

    found
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attrs;

    loop {
        let at = rest.find(name)?;
        let preceding = rest[..at].chars().next_back();
        let after = &rest[at + name.len()..];
        rest = after;

        if preceding.is_some_and(|c| !c.is_whitespace() && c != ':') {
            continue;
        }
        let Some(value) = after.trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value.trim_start();
        let quote = value.chars().next()?;
        if quote != '"' && quote != '\'' {
            continue;
        }
        let value = &value[1..];
        let end = value.find(quote)?;
        return Some(&value[..end]);
    }
}

pub fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
