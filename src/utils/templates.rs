//! HTML pages handed to joining attendees.

/// Seconds the waiting page pauses before retrying a join.
pub const RETRY_JOIN_DELAY: u32 = 5;

/// Escape text for use in element content and quoted attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Page sent along with a join redirect.
pub fn redirect(url: &str) -> String {
    let url = escape_html(url);
    format!(
        r#"<html>
  <head>
    <meta http-equiv="Refresh" content="0; url={url}" />
  </head>
  <body>
    <h1>You are being redirected to the meeting</h1>
    <p>The meeting can be found at <a href="{url}">{url}</a>.</p>
  </body>
</html>
"#
    )
}

/// Waiting page shown while a meeting is not ready yet.
pub fn retry_join(url: &str) -> String {
    let url = escape_html(url);
    format!(
        r#"<html>
  <head>
    <meta http-equiv="Refresh" content="{RETRY_JOIN_DELAY}; url={url}" />
  </head>
  <body>
    <h1>The meeting is being prepared</h1>
    <p>You will join automatically in a moment. If nothing happens,
      <a href="{url}">retry joining</a>.</p>
  </body>
</html>
"#
    )
}

pub fn attendees_limit_reached() -> String {
    r#"<html>
  <body>
    <h1>The meeting could not be joined</h1>
    <p>The attendee limit of this service is reached. Please try again later.</p>
  </body>
</html>
"#
    .to_string()
}
