//! Pairing QR rendering for the terminal and the `/qr` panel.

use anyhow::{Result, anyhow};
use qrcode::QrCode;
use qrcode::render::{svg, unicode};

/// Seconds between reloads while a challenge is shown.
pub const CHALLENGE_REFRESH_SECS: u32 = 20;
/// Seconds between reloads while waiting for the first challenge.
pub const WAITING_REFRESH_SECS: u32 = 5;

fn encode(token: &str) -> Result<QrCode> {
    let payload = token.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }
    QrCode::new(payload.as_bytes()).map_err(|err| anyhow!("Failed to encode pairing QR: {err}"))
}

/// Half-block text suitable for stderr.
pub fn render_terminal(token: &str) -> Result<String> {
    Ok(encode(token)?
        .render::<unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

pub fn render_svg(token: &str) -> Result<String> {
    Ok(encode(token)?
        .render::<svg::Color<'_>>()
        .min_dimensions(264, 264)
        .dark_color(svg::Color("#111827"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(refresh_secs: Option<u32>, card: &str) -> String {
    let refresh = refresh_secs
        .map(|s| format!(r#"<meta http-equiv="refresh" content="{s}">"#))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    {refresh}
    <title>WhatsApp Bridge</title>
    <style>
      body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Helvetica, Arial, sans-serif; background: #f0f2f5; display: flex; flex-direction: column; align-items: center; min-height: 100vh; margin: 0; padding: 20px; box-sizing: border-box; }}
      .card {{ background: white; padding: 24px; border-radius: 12px; box-shadow: 0 2px 5px rgba(0,0,0,0.1); text-align: center; max-width: 400px; width: 100%; }}
      h2 {{ margin-top: 0; color: #1f2937; }}
      svg {{ margin: 15px 0; max-width: 100%; height: auto; }}
      p {{ color: #666; font-size: 14px; }}
    </style>
  </head>
  <body>
    <div class="card">
{card}
    </div>
  </body>
</html>
"#
    )
}

pub fn waiting_page() -> String {
    page(
        Some(WAITING_REFRESH_SECS),
        "      <h2>Starting bridge</h2>\n      <p>Waiting for a pairing code...</p>",
    )
}

pub fn challenge_page(svg: &str) -> String {
    page(
        Some(CHALLENGE_REFRESH_SECS),
        &format!(
            "      <h2>Link your WhatsApp</h2>\n      {svg}\n      <p>Open WhatsApp &gt; Linked Devices. The code changes every {CHALLENGE_REFRESH_SECS} seconds.</p>"
        ),
    )
}

pub fn connected_page(identity: &str) -> String {
    page(
        None,
        &format!(
            "      <h2>Connected</h2>\n      <p>Session active as {}</p>",
            escape(identity)
        ),
    )
}
