use serde::{Deserialize, Serialize};

/// Which viewer the index page bootstraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageVariant {
    /// Binary frames pushed over `/socket`
    #[default]
    WebSocket,
    /// `<img>` reloading `/frame.jpg`
    Polling,
}

impl PageVariant {
    pub fn html(self) -> &'static str {
        match self {
            PageVariant::WebSocket => WEBSOCKET_PAGE,
            PageVariant::Polling => POLLING_PAGE,
        }
    }
}

const POLLING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>camserve</title>
<style>body{margin:0;background:#000}img{display:block;max-width:100vw;max-height:100vh;margin:auto}</style>
</head>
<body>
<img id="frame" alt="camera">
<script>
const img = document.getElementById("frame");
function next() { img.src = "/frame.jpg?t=" + Date.now(); }
img.onload = next;
img.onerror = () => setTimeout(next, 1000);
next();
</script>
</body>
</html>
"#;

const WEBSOCKET_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>camserve</title>
<style>body{margin:0;background:#000}img{display:block;max-width:100vw;max-height:100vh;margin:auto}</style>
</head>
<body>
<img id="frame" alt="camera">
<script>
const img = document.getElementById("frame");
function connect() {
  const ws = new WebSocket("ws://" + location.host + "/socket");
  ws.binaryType = "blob";
  ws.onmessage = (event) => {
    const url = URL.createObjectURL(new Blob([event.data], { type: "image/jpeg" }));
    img.onload = () => URL.revokeObjectURL(url);
    img.src = url;
  };
  ws.onclose = () => setTimeout(connect, 1000);
}
connect();
</script>
</body>
</html>
"#;
