//! HTML fragments and the demo page, rendered with `maud`.
//!
//! Templates are a fixed, compiled set addressed by name. Every interpolated
//! value goes through maud's escaping, so user input never becomes markup.

use std::collections::BTreeMap;

use maud::{DOCTYPE, Markup, PreEscaped, html};
use roomcast_core::RenderError;

/// Greeting fragment. Variables: `message`.
pub const HELLO_MESSAGE: &str = "hello_message.html";
/// Chat line fragment. Variables: `username`, `message`, `timestamp`.
pub const CHAT_MESSAGE: &str = "chat_message.html";

/// Renders a named template against a context.
///
/// Implementations must be pure: same name and context, same output.
pub trait TemplateRenderer: Send + Sync {
    /// Render `name` with `context`.
    fn render(&self, name: &str, context: &TemplateContext) -> Result<String, RenderError>;
}

/// Variables passed to a template.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a variable.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.vars.insert(key.into(), value.into());
        self
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Look up a variable the template cannot do without.
    pub fn require(&self, template: &str, key: &str) -> Result<&str, RenderError> {
        self.get(key).ok_or_else(|| RenderError::MissingVariable {
            template: template.to_owned(),
            variable: key.to_owned(),
        })
    }
}

/// The built-in fragment set.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaudTemplates;

impl TemplateRenderer for MaudTemplates {
    fn render(&self, name: &str, context: &TemplateContext) -> Result<String, RenderError> {
        let markup = match name {
            HELLO_MESSAGE => hello_message(context.require(name, "message")?),
            CHAT_MESSAGE => chat_message(
                context.require(name, "username")?,
                context.require(name, "message")?,
                context.require(name, "timestamp")?,
            ),
            other => return Err(RenderError::UnknownTemplate(other.to_owned())),
        };
        Ok(markup.into_string())
    }
}

fn hello_message(message: &str) -> Markup {
    html! {
        div class="greeting-message" {
            p { (message) }
        }
    }
}

fn chat_message(username: &str, message: &str, timestamp: &str) -> Markup {
    html! {
        div class="chat-message" {
            span class="timestamp" { "[" (timestamp) "]" }
            " "
            strong class="username" { (username) ":" }
            " "
            span class="text" { (message) }
        }
    }
}

/// The demo page served at `/`.
pub fn index_page() -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "roomcast" }
                style { (PreEscaped(PAGE_CSS)) }
            }
            body {
                h1 { "roomcast" }
                section {
                    h2 { "Greeting" }
                    form data-action="say_hello" {
                        input type="text" name="name" placeholder="Your name";
                        button type="submit" { "Say hello" }
                    }
                    div id="greeting" {}
                }
                hr;
                section {
                    h2 { "Chat" }
                    div id="chat-messages" {}
                    form data-action="send_message" {
                        input type="text" name="username" placeholder="Name";
                        input type="text" name="message" placeholder="Message" data-reset;
                        button type="submit" { "Send" }
                    }
                    p class="hint" { "Share this page's URL to chat in the same room." }
                }
                script { (PreEscaped(CLIENT_JS)) }
            }
        }
    }
}

const PAGE_CSS: &str = "
body { font-family: system-ui, sans-serif; max-width: 40rem; margin: 2rem auto; }
#chat-messages { border: 1px solid #ccc; min-height: 8rem; padding: .5rem; margin-bottom: .5rem; }
.timestamp { color: #888; }
.hint { color: #888; font-size: .85rem; }
";

const CLIENT_JS: &str = r#"
(function () {
  const params = new URLSearchParams(location.search);
  let room = params.get("room") || "";
  const proto = location.protocol === "https:" ? "wss:" : "ws:";
  const query = room ? "?room=" + encodeURIComponent(room) : "";
  const socket = new WebSocket(proto + "//" + location.host + "/ws" + query);

  socket.addEventListener("message", function (event) {
    const msg = JSON.parse(event.data);
    if (msg.type === "connection.established") {
      room = msg.data.room;
      params.set("room", room);
      history.replaceState(null, "", "?" + params.toString());
      return;
    }
    if (msg.type) {
      return;
    }
    const target = document.querySelector(msg.target);
    if (!target) {
      return;
    }
    if (msg.append) {
      target.insertAdjacentHTML("beforeend", msg.html);
    } else {
      target.innerHTML = msg.html;
    }
  });

  document.querySelectorAll("form[data-action]").forEach(function (form) {
    form.addEventListener("submit", function (event) {
      event.preventDefault();
      const fields = {};
      new FormData(form).forEach(function (value, key) {
        fields[key] = String(value);
      });
      socket.send(JSON.stringify({ action: form.dataset.action, room: room, form: fields }));
      form.querySelectorAll("[data-reset]").forEach(function (input) {
        input.value = "";
      });
    });
  });
})();
"#;
