//! Static assets served by the embedded HTTP server.
//!
//! Default success/error pages for the consent flow, generated login forms
//! for the credential-blob kinds, a stylesheet and a favicon. Handles may
//! override the success, error and login pages through hints.

use cirrus_core::ProviderKind;

/// Shown after a successful authorization redirect.
pub const DEFAULT_SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Authorization successful</title>
<link rel="stylesheet" href="/static/style.css"></head>
<body>
  <h1>Authorization successful</h1>
  <p>This window can be closed.</p>
  <script>setTimeout(function() { window.close(); }, 3000);</script>
</body>
</html>"#;

/// Shown when the provider redirected back with an error.
pub const DEFAULT_ERROR_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Authorization failed</title>
<link rel="stylesheet" href="/static/style.css"></head>
<body>
  <h1>Authorization failed</h1>
  <p>Close this window and try again.</p>
</body>
</html>"#;

/// Minimal shared stylesheet.
pub const STYLE_CSS: &str = "body{font-family:sans-serif;text-align:center;padding-top:50px}\
input{display:block;margin:8px auto;padding:6px;width:240px}\
button{padding:6px 24px}";

/// A 1x1 transparent GIF; enough to satisfy favicon probes.
pub const FAVICON: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Resolves a named static asset.
pub fn static_asset(name: &str) -> Option<(&'static [u8], &'static str)> {
    match name {
        "style.css" => Some((STYLE_CSS.as_bytes(), "text/css")),
        "favicon.ico" => Some((FAVICON, "image/gif")),
        _ => None,
    }
}

/// Fields collected by the generated login form of a credential-blob kind.
fn login_fields(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::AmazonS3 => &["username", "password", "bucket", "endpoint"],
        ProviderKind::WebDav => &["username", "password", "webdav_url"],
        _ => &["username", "password"],
    }
}

/// Builds the login page for a kind without an upstream consent screen.
/// Submitting redirects back to the authorization endpoint with the
/// credential blob as the `code` query parameter.
pub fn login_page(kind: ProviderKind) -> String {
    let fields = login_fields(kind);
    let inputs: String = fields
        .iter()
        .map(|field| {
            let input_type = if *field == "password" { "password" } else { "text" };
            format!(r#"<input type="{input_type}" id="{field}" placeholder="{field}">"#)
        })
        .collect();
    let collect: String = fields
        .iter()
        .map(|field| format!(r#"blob.{field} = document.getElementById("{field}").value;"#))
        .collect();
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{kind} login</title>
<link rel="stylesheet" href="/static/style.css"></head>
<body>
  <h1>{kind}</h1>
  {inputs}
  <button onclick="submitLogin()">Log in</button>
  <script>
    function submitLogin() {{
      var blob = {{}};
      {collect}
      window.location.href = "/{kind}?code=" + encodeURIComponent(JSON.stringify(blob));
    }}
  </script>
</body>
</html>"#,
        kind = kind.name(),
        inputs = inputs,
        collect = collect,
    )
}
