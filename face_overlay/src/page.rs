//! The viewer page.
//!
use crate::{VIDEO_HEIGHT, VIDEO_WIDTH};

const START_COLOR: &str = "#4CAF50";
const STOP_COLOR: &str = "#f44336";

/// Label and color of the toggle button.
pub fn toggle_button(active: bool) -> (&'static str, &'static str) {
    match active {
        true => ("Stop Webcam", STOP_COLOR),
        false => ("Start Webcam", START_COLOR),
    }
}

/// Render the page for the given capture state.
///
/// The video and the overlay above it are only part of the page while capture
/// is active.
pub fn render(active: bool) -> String {
    let (label, color) = toggle_button(active);

    let feed = match active {
        true => format!(
            r#"
        <div style="position: relative; display: inline-block">
            <img src="./video_stream" width="{VIDEO_WIDTH}" height="{VIDEO_HEIGHT}"
                 style="width: {VIDEO_WIDTH}px; height: {VIDEO_HEIGHT}px; border: 1px solid #ccc; border-radius: 8px">
            <img src="./overlay_stream" width="{VIDEO_WIDTH}" height="{VIDEO_HEIGHT}"
                 style="position: absolute; top: 0; left: 0; pointer-events: none">
        </div>"#
        ),
        false => String::new(),
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Webcam Feed</title>
</head>
<body>
    <div class="webcam-container" style="text-align: center">
        <h1>Webcam Feed</h1>{feed}
        <form method="post" action="./toggle">
            <button type="submit"
                    style="margin-top: 10px; padding: 10px 20px; background-color: {color}; color: #fff; border: none; border-radius: 4px; cursor: pointer">{label}</button>
        </form>
    </div>
</body>
</html>
"#
    )
}
