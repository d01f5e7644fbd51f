//! Generate an HTML/SVG preview of a frame as the drum paints it.
//!
//! Two panels: the raster as it should appear, each row tagged with the
//! facet that sweeps it, and the facets in the order they pass the beam,
//! shifted by their calibration offsets.

use projector_core::timing::RevolutionTiming;
use projector_core::{RasterSource, RigConfig, Ticks};

/// Pixel cell size in SVG pixels.
const CELL: f64 = 9.0;
/// Gap between cells.
const GAP: f64 = 1.0;
const STEP: f64 = CELL + GAP;
/// Room for the row labels left of each panel.
const LABEL_W: f64 = 120.0;
const PANEL_GAP: f64 = 60.0;
const MARGIN: f64 = 20.0;

struct Line<'a> {
    label: String,
    bytes: &'a [u8],
    /// Horizontal shift in pixels.
    shift: f64,
}

fn render_panel(title: &str, lines: &[Line<'_>], y_offset: f64) -> String {
    let mut svg = format!(r#"<g transform="translate({MARGIN}, {y_offset})">"#);
    svg.push_str(&format!(
        r#"<text x="0" y="-10" class="panel-title">{}</text>"#,
        html_escape(title)
    ));

    for (index, line) in lines.iter().enumerate() {
        let y = index as f64 * STEP;
        svg.push_str(&format!(
            r#"<text x="0" y="{}" class="label">{}</text>"#,
            y + CELL - 1.0,
            html_escape(&line.label)
        ));

        for (column, byte) in line.bytes.iter().enumerate() {
            for bit in 0..8 {
                let x = LABEL_W + (line.shift + (column * 8 + bit) as f64) * STEP;
                let class = if byte & (0x80 >> bit) != 0 {
                    "px on"
                } else {
                    "px"
                };
                svg.push_str(&format!(
                    r#"<rect x="{x}" y="{y}" width="{CELL}" height="{CELL}" class="{class}"/>"#
                ));
            }
        }
    }

    svg.push_str("</g>");
    svg
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Ticks per pixel at revolution length `period`.
fn pixel_pitch(config: &RigConfig, period: Ticks) -> f64 {
    let timing = RevolutionTiming::derive(
        0,
        period,
        config.facet_count(),
        config.first_facet_fraction,
        &config.delay_map,
    );
    timing.illumination as f64 / (config.row_bytes * 8) as f64
}

/// Generate the complete HTML document with inline SVG.
pub fn generate_html<S: RasterSource + ?Sized>(
    source: &S,
    config: &RigConfig,
    offsets: &[i16],
    period: Ticks,
) -> String {
    let facets = config.facet_count();
    let pitch = pixel_pitch(config, period);
    let mut panels: Vec<(String, Vec<Line<'_>>)> = Vec::new();

    for plane in 0..config.laser_planes {
        let mut painter = vec![0; facets];
        for facet in 0..facets {
            painter[config.facet_map.raster_row(facet)] = facet;
        }

        let raster = (0..facets)
            .map(|row| Line {
                label: format!("row {row} <- facet {}", painter[row]),
                bytes: source.row(plane, row),
                shift: 0.0,
            })
            .collect();
        panels.push((format!("Plane {plane}: raster"), raster));

        let scan = (0..facets)
            .map(|facet| {
                let offset = offsets.get(facet).copied().unwrap_or(0);
                Line {
                    label: format!("facet {facet} ({offset:+})"),
                    bytes: source.row(plane, config.facet_map.raster_row(facet)),
                    shift: if pitch > 0.0 {
                        f64::from(offset) / pitch
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        panels.push((format!("Plane {plane}: scan order"), scan));
    }

    let panel_height = facets as f64 * STEP + PANEL_GAP;
    let total_width = LABEL_W + (config.row_bytes * 8) as f64 * STEP + 2.0 * MARGIN;
    let total_height = panels.len() as f64 * panel_height + 2.0 * MARGIN;

    let mut html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Projector Scan Preview</title>
<style>
  body {{
    background: #101418;
    color: #ddd;
    font-family: system-ui, -apple-system, sans-serif;
    display: flex;
    justify-content: center;
    padding: 2em;
  }}
  .px {{
    fill: #1c2229;
  }}
  .px.on {{
    fill: #ff3030;
  }}
  .label {{
    fill: #aaa;
    font-family: "JetBrains Mono", "Fira Code", monospace;
    font-size: 10px;
  }}
  .panel-title {{
    fill: #ff6060;
    font-size: 14px;
    font-weight: bold;
  }}
</style>
</head>
<body>
<svg width="{total_width}" height="{total_height}" xmlns="http://www.w3.org/2000/svg">
"#
    );

    for (index, (title, lines)) in panels.iter().enumerate() {
        let y_offset = MARGIN + index as f64 * panel_height + 30.0;
        html.push_str(&render_panel(title, lines, y_offset));
        html.push('\n');
    }

    html.push_str("</svg>\n</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use projector_core::FrameBuffer;

    fn frame() -> FrameBuffer<64> {
        let mut frame = FrameBuffer::for_rig(&RigConfig::reference()).unwrap();
        frame.row_mut(5)[0] = 0x80;
        frame
    }

    #[test]
    fn both_panels_show_every_lit_pixel() {
        let config = RigConfig::reference();
        let html = generate_html(&frame(), &config, &[0; 8], 80_000);
        assert_eq!(html.matches(r#"class="px on""#).count(), 2);
        assert_eq!(html.matches("<rect").count(), 2 * 8 * 64);
    }

    #[test]
    fn rows_are_tagged_with_their_facet() {
        let config = RigConfig::reference();
        let html = generate_html(&frame(), &config, &[0; 8], 80_000);
        // Facet 1 sweeps row 5 on the reference drum.
        assert!(html.contains("row 5 &lt;- facet 1"));
        assert!(html.contains("facet 1 (+0)"));
    }

    #[test]
    fn offsets_shift_the_scan_line() {
        let config = RigConfig::reference();
        // 80_000 ticks: 5_000 ticks lit over 64 pixels.
        let pitch = pixel_pitch(&config, 80_000);
        assert!((pitch - 78.125).abs() < 1e-9);

        let mut offsets = [0i16; 8];
        offsets[1] = 625;
        let html = generate_html(&frame(), &config, &offsets, 80_000);
        // Eight pixels to the right.
        let shifted = LABEL_W + 8.0 * STEP;
        assert!(html.contains(&format!(r#"<rect x="{shifted}" y="10" width="9" height="9" class="px on"/>"#)));
    }
}
