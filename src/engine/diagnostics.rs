use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::core::Hash32;
use crate::graph::RuleGraph;

/// One execution of a rule body.
#[derive(Debug, Clone)]
pub struct Execution {
    pub rule: String,
    /// Fingerprint of the params the node was keyed on.
    pub params: Hash32,
    pub(crate) entry: NodeIndex,
    pub start: Instant,
    pub duration: Duration,
}

impl Execution {
    fn label(&self) -> String {
        format!("{} ({})", self.rule, self.params.short())
    }
}

/// Session diagnostics and performance metrics.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Every rule body executed in the session, in completion order.
    pub executions: Vec<Execution>,
    /// Number of rule bodies executed.
    pub executed: usize,
    /// Number of stale nodes whose dependencies turned out unchanged, reused
    /// without running the body.
    pub cleaned: usize,
    /// Number of demands answered straight from the memo table.
    pub memo_hits: usize,
}

impl Diagnostics {
    /// How many times a rule with this name ran in the session.
    pub fn runs_of(&self, rule: &str) -> usize {
        self.executions.iter().filter(|e| e.rule == rule).count()
    }

    /// Renders the rule graph as a Mermaid diagram, color-coded by the time
    /// spent executing each entry in this session.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Not executed (cached or not demanded)
    pub fn render_mermaid(&self, graph: &RuleGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let mut times: HashMap<NodeIndex, Duration> = HashMap::new();
        for exec in &self.executions {
            *times.entry(exec.entry).or_default() += exec.duration;
        }

        let mut min_time = times.values().map(Duration::as_secs_f64).fold(f64::MAX, f64::min);
        let mut max_time = times.values().map(Duration::as_secs_f64).fold(f64::MIN, f64::max);

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // avoid dividing by zero when everything took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in graph.node_indices() {
            let name = graph.label(index).replace('"', "#quot;");

            let (label_extra, color_code) = match times.get(&index) {
                Some(duration) => {
                    let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);

                    // 0.0 (green) -> 0.5 (yellow) -> 1.0 (red)
                    let (r, g, b) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255, 0)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
                    };

                    (format!("{duration:.2?}"), format!("#{r:02X}{g:02X}{b:02X}"))
                }
                None => ("Cached".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label_extra);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color_code);
        }

        for (consumer, dependency, key) in graph.edges() {
            let key = format!("{key:?}").replace('<', "&lt;").replace('>', "&gt;");
            let _ = writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                dependency.index(),
                key,
                consumer.index()
            );
        }

        f
    }
}

// WATERFALL

const CHART_WIDTH: u32 = 960;
const LANE_HEIGHT: u32 = 22;
const MARGIN: u32 = 16;
const AXIS_HEIGHT: u32 = 40;
const TICKS: u32 = 4;
/// Rough advance of one character of the bar labels.
const CHAR_WIDTH: f64 = 6.5;

/// An execution placed on the chart, times in microseconds since the first
/// execution started.
struct Span<'a> {
    exec: &'a Execution,
    lane: usize,
    from: u128,
    to: u128,
}

/// Packs executions into lanes, greedily reusing the first lane that is free
/// when an execution starts. The number of lanes is the peak concurrency of
/// the session.
fn pack(executions: &[Execution]) -> (Vec<Span<'_>>, usize) {
    let Some(origin) = executions.iter().map(|e| e.start).min() else {
        return (Vec::new(), 0);
    };

    let mut sorted: Vec<&Execution> = executions.iter().collect();
    sorted.sort_by_key(|e| (e.start, e.duration));

    let mut lanes: Vec<u128> = Vec::new();
    let mut spans = Vec::with_capacity(sorted.len());

    for exec in sorted {
        let from = exec.start.duration_since(origin).as_micros();
        let to = from + exec.duration.as_micros().max(1);

        let lane = match lanes.iter().position(|end| *end <= from) {
            Some(lane) => {
                lanes[lane] = to;
                lane
            }
            None => {
                lanes.push(to);
                lanes.len() - 1
            }
        };

        spans.push(Span { exec, lane, from, to });
    }

    (spans, lanes.len())
}

fn escape(text: &str) -> String {
    text.chars().fold(String::with_capacity(text.len()), |mut out, c| {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
        out
    })
}

fn human(micros: u128) -> String {
    match micros {
        0..1_000 => format!("{micros}µs"),
        1_000..1_000_000 => format!("{:.1}ms", micros as f64 / 1e3),
        _ => format!("{:.2}s", micros as f64 / 1e6),
    }
}

/// Same rule, same color.
fn hue(rule: &str) -> u32 {
    rule.bytes().fold(7u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32)) % 360
}

impl Diagnostics {
    /// Writes [`render_waterfall`](Diagnostics::render_waterfall) to `path`.
    pub fn render_waterfall_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders the executions of the session as an SVG timeline. Executions
    /// that ran concurrently are stacked in separate lanes, hovering a bar
    /// shows its rule, params and duration.
    pub fn render_waterfall(&self) -> String {
        let (spans, lanes) = pack(&self.executions);
        let total = spans.iter().map(|span| span.to).max().unwrap_or(0);

        let width = CHART_WIDTH + 2 * MARGIN;
        let height = AXIS_HEIGHT + (lanes.max(1) as u32) * LANE_HEIGHT + MARGIN;
        let scale = CHART_WIDTH as f64 / total.max(1) as f64;

        let mut svg = String::new();
        let _ = write!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" font-family="monospace" font-size="11">"#
        );

        if spans.is_empty() {
            let _ = write!(svg, r#"<text x="{MARGIN}" y="{AXIS_HEIGHT}">No rules ran</text></svg>"#);
            return svg;
        }

        let _ = write!(
            svg,
            r#"<text x="{MARGIN}" y="{y}">{count} executions in {lanes} lanes, {total}</text>"#,
            y = MARGIN,
            count = spans.len(),
            total = human(total),
        );

        for tick in 0..=TICKS {
            let x = MARGIN as f64 + CHART_WIDTH as f64 * tick as f64 / TICKS as f64;
            let at = total * tick as u128 / TICKS as u128;
            let _ = write!(
                svg,
                r##"<line x1="{x:.1}" y1="{top}" x2="{x:.1}" y2="{height}" stroke="#ddd"/><text x="{x:.1}" y="{label}" fill="#888" text-anchor="middle">{at}</text>"##,
                top = AXIS_HEIGHT - 6,
                label = AXIS_HEIGHT - 10,
                at = human(at),
            );
        }

        for span in &spans {
            let label = escape(&span.exec.label());
            let x = MARGIN as f64 + span.from as f64 * scale;
            let w = ((span.to - span.from) as f64 * scale).max(1.0);
            let y = AXIS_HEIGHT + span.lane as u32 * LANE_HEIGHT;

            let _ = write!(
                svg,
                r#"<g><title>{label} {dur}</title><rect x="{x:.1}" y="{y}" width="{w:.1}" height="{h}" fill="hsl({hue},60%,65%)"/>"#,
                dur = human(span.to - span.from),
                h = LANE_HEIGHT - 4,
                hue = hue(&span.exec.rule),
            );

            // only label bars wide enough to hold the rule name
            if w > span.exec.rule.chars().count() as f64 * CHAR_WIDTH {
                let _ = write!(
                    svg,
                    r#"<text x="{tx:.1}" y="{ty}">{rule}</text>"#,
                    tx = x + 3.0,
                    ty = y + LANE_HEIGHT / 2 + 2,
                    rule = escape(&span.exec.rule),
                );
            }
            svg.push_str("</g>");
        }

        svg.push_str("</svg>");
        svg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(rule: &str, start: Instant, millis: u64) -> Execution {
        Execution {
            rule: rule.to_string(),
            params: Hash32::hash(rule),
            entry: NodeIndex::new(0),
            start,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_waterfall_lists_every_execution() {
        let start = Instant::now();
        let diagnostics = Diagnostics {
            executions: vec![
                execution("resolve<targets>", start, 5),
                execution("run_tests", start + Duration::from_millis(5), 10),
            ],
            executed: 2,
            ..Default::default()
        };

        let svg = diagnostics.render_waterfall();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("resolve&lt;targets&gt;"));
        assert!(svg.contains("run_tests"));
        assert!(svg.contains("2 executions in 1 lanes"));
        assert_eq!(diagnostics.runs_of("run_tests"), 1);
    }

    #[test]
    fn test_concurrent_executions_get_their_own_lane() {
        let start = Instant::now();
        let executions = vec![
            execution("a", start, 10),
            execution("b", start + Duration::from_millis(2), 10),
            execution("c", start + Duration::from_millis(10), 5),
            execution("d", start + Duration::from_millis(13), 1),
        ];

        let (spans, lanes) = pack(&executions);
        let lane_of = |rule: &str| spans.iter().find(|s| s.exec.rule == rule).unwrap().lane;

        assert_eq!(lanes, 2);
        assert_eq!(lane_of("a"), 0);
        assert_eq!(lane_of("b"), 1);
        // a is done by the time c starts
        assert_eq!(lane_of("c"), 0);
        assert_eq!(lane_of("d"), 1);
    }

    #[test]
    fn test_empty_waterfall() {
        assert!(Diagnostics::default().render_waterfall().contains("No rules ran"));
    }
}
