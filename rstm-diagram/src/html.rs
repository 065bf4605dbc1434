//! Standalone HTML pages for Mermaid diagrams.

use crate::MERMAID_VERSION;

/// Wraps a diagram body produced by [`state_diagram`](crate::state_diagram)
/// in an HTML page that renders it with Mermaid loaded from a CDN.
pub fn html_page(title: &str, diagram: &str) -> String {
    let body = diagram
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("      {}", escape(line))
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>{title}</title>
  <script type="module">
    import mermaid from 'https://cdn.jsdelivr.net/npm/mermaid@{version}/dist/mermaid.esm.min.mjs';
    mermaid.initialize({{ startOnLoad: true }});
  </script>
</head>
<body>
  <div class="mermaid">
    ---
    title: {title}
    ---
    stateDiagram-v2
{body}
  </div>
</body>
</html>
"#,
        title = escape(title),
        version = MERMAID_VERSION,
        body = body,
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
