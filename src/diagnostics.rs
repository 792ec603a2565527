//! Human-readable views of the dependency graph and of a finished build.

use std::collections::HashSet;
use std::fmt::{Display, Formatter, Write};
use std::time::Instant;

use petgraph::visit::EdgeRef;

use crate::decider::Decider;
use crate::engine::{BuildReport, Reason, TaskExecution, evaluate};
use crate::graph::{EdgeKind, Graph, NodeId, NodeState};
use crate::sig::SignatureStore;

/// Why `id` would be rebuilt now, empty if it is up to date or has no
/// builder. The children of `id` are read as they are on disk, whether or not
/// they were built yet.
pub fn explain(graph: &Graph, store: &SignatureStore, decider: Decider, id: NodeId) -> Vec<Reason> {
    let Some(batch) = graph.node(id).batch() else {
        return Vec::new();
    };

    evaluate(graph, store, decider, batch)
        .reasons
        .into_iter()
        .filter(|(target, _)| *target == id)
        .map(|(_, reason)| reason)
        .collect()
}

fn flags(graph: &Graph, id: NodeId) -> String {
    let node = graph.node(id);
    let flag = |on: bool, c: char| if on { c } else { ' ' };
    format!(
        "[{} {} {} {}]",
        flag(node.exists(), 'E'),
        flag(node.is_derived(), 'D'),
        flag(node.state().is_done(), 'U'),
        flag(graph.is_side_effect(id), 'S'),
    )
}

/// Dumps the dependencies of `root` as an indented tree.
///
/// Every line starts with the status flags of the node: `E`xists, `D`erived,
/// `U`p to date (in the last round) and `S`ide effect. A node whose children
/// were already listed is shown in brackets without them.
///
/// ```text
/// [E D U  ] out
/// [E D U  ]   +-mid
/// [E      ]     +-in
/// ```
pub fn tree(graph: &Graph, root: NodeId) -> String {
    let mut out = String::new();
    let mut expanded = HashSet::new();
    let mut stack = vec![(root, 0usize)];

    while let Some((id, depth)) = stack.pop() {
        let indent = if depth == 0 {
            String::new()
        } else {
            format!("{}+-", "  ".repeat(depth))
        };

        let children = graph.children(id);
        if !expanded.insert(id) && !children.is_empty() {
            let _ = writeln!(out, "{} {indent}[{}]", flags(graph, id), graph.name(id));
            continue;
        }

        let _ = writeln!(out, "{} {indent}{}", flags(graph, id), graph.name(id));
        for &child in children.iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    out
}

fn duration_color(t: f64) -> String {
    // 0.0 green, 0.5 yellow, 1.0 red
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{r:02X}{g:02X}{b:02X}")
}

/// Renders the graph as a Mermaid diagram.
///
/// * **Green** to **Red**: executed, from fastest to slowest
/// * **Blue**: up to date or retrieved from the cache
/// * **Grey**: failed or skipped
/// * no fill: sources and nodes not part of the build
pub fn render_mermaid(graph: &Graph, report: &BuildReport) -> String {
    let mut f = String::new();
    let _ = writeln!(f, "graph LR");

    let times = &report.execution_times;
    let (min, max) = times
        .values()
        .map(|t| t.duration.as_secs_f64())
        .fold((f64::MAX, f64::MIN), |(lo, hi), s| (lo.min(s), hi.max(s)));
    let (min, span) = if min > max {
        (0.0, 1.0)
    } else if (max - min).abs() < f64::EPSILON {
        (min, 1.0)
    } else {
        (min, max - min)
    };

    for id in graph.node_ids() {
        let node = graph.node(id);
        let name = node.name().replace('"', "#quot;");
        let index = id.index();

        let (label, fill) = match times.get(node.name()) {
            Some(exec) => (
                format!("{:.2?}", exec.duration),
                Some(duration_color((exec.duration.as_secs_f64() - min) / span)),
            ),
            None => match node.state() {
                NodeState::Failed => ("Failed".to_string(), Some("#D3D3D3".to_string())),
                NodeState::UpToDate | NodeState::Built if node.is_derived() => {
                    ("Up to date".to_string(), Some("#ADD8E6".to_string()))
                }
                _ => (String::new(), None),
            },
        };

        if label.is_empty() {
            let _ = writeln!(f, "    {index}[\"{name}\"]");
        } else {
            let _ = writeln!(f, "    {index}[\"{name}\\n{label}\"]");
        }
        if let Some(fill) = fill {
            let _ = writeln!(f, "    style {index} fill:{fill}");
        }
    }

    for edge in graph.graph.edge_references() {
        let (from, to) = (edge.source().index(), edge.target().index());
        let _ = match edge.weight().kind {
            EdgeKind::Source => writeln!(f, "    {to} --> {from}"),
            EdgeKind::Depends => writeln!(f, "    {to} -- depends --> {from}"),
            EdgeKind::Implicit => writeln!(f, "    {to} -. implicit .-> {from}"),
            EdgeKind::SideEffect => writeln!(f, "    {from} -. side effect .-> {to}"),
        };
    }

    f
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 30,
            label_width: 300,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, rows: usize) -> u32 {
        self.header_height + (rows as u32 * self.row_height) + self.padding
    }

    fn bar_x(&self, fraction: f64) -> f64 {
        self.label_width as f64 + self.padding as f64 + fraction * self.chart_width as f64
    }
}

fn format_micros(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

/// Renders the task timings of a build as an SVG waterfall chart, one row per
/// task, labelled with its first target.
pub fn render_waterfall(report: &BuildReport) -> String {
    let mut tasks: Vec<(&str, &TaskExecution)> = report
        .execution_times
        .iter()
        .map(|(name, exec)| (name.as_str(), exec))
        .collect();
    tasks.sort_by_key(|(_, exec)| exec.start);

    let (Some(first), Some(end)) = (
        tasks.first(),
        tasks.iter().map(|(_, t)| t.start + t.duration).max(),
    ) else {
        return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#
            .to_string();
    };
    let global_start: Instant = first.1.start;
    let total_micros = end.duration_since(global_start).as_micros().max(1) as f64;

    let layout = WaterfallLayout::default();
    let mut svg = String::with_capacity(tasks.len() * 500);

    let css = r#"
        .row:nth-child(even) { fill: #f9f9f9; }
        .row:nth-child(odd) { fill: #ffffff; }
        text { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 12px; }
        .bar { fill: #3b82f6; rx: 4; }
        .label { fill: #333; }
        .time { fill: #666; font-size: 11px; }
        .grid-line { stroke: #e5e7eb; stroke-width: 1; }
        .axis-label { fill: #9ca3af; font-size: 10px; }"#;
    let _ = write!(
        svg,
        r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>{css}</style><rect width="100%" height="100%" fill="white" />"#,
        layout.total_width(),
        layout.total_height(tasks.len()),
    );

    let steps = 5;
    for i in 0..=steps {
        let pct = i as f64 / steps as f64;
        let x = layout.bar_x(pct);
        let _ = write!(
            svg,
            r#"<line x1="{x:.1}" y1="{}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{}" text-anchor="middle" class="axis-label">{}</text>"#,
            layout.header_height,
            layout.header_height - 5,
            format_micros(total_micros * pct),
        );
    }

    for (i, (name, exec)) in tasks.iter().enumerate() {
        let name = XmlSafe(name);
        let y = layout.header_height + (i as u32 * layout.row_height);
        let y_center = y + layout.row_height / 2;

        let offset = exec.start.duration_since(global_start).as_micros() as f64;
        let duration = exec.duration.as_micros() as f64;
        let bar_x = layout.bar_x(offset / total_micros);
        let bar_w = (duration / total_micros * layout.chart_width as f64).max(1.0);

        let _ = write!(
            svg,
            r#"<rect x="0" y="{y}" width="100%" height="{h}" class="row" /><text x="{pad}" y="{y_center}" class="label" dominant-baseline="middle">{name}</text><rect x="{bar_x:.1}" y="{bar_y}" width="{bar_w:.1}" height="{bar_h}" class="bar"><title>{name}: {dur:.2?}</title></rect><text x="{text_x:.1}" y="{y_center}" class="time" dominant-baseline="middle">{text}</text>"#,
            h = layout.row_height,
            pad = layout.padding,
            bar_y = y + 5,
            bar_h = layout.row_height - 10,
            dur = exec.duration,
            text_x = bar_x + bar_w + 5.0,
            text = format_micros(duration),
        );
    }

    svg.push_str("</svg>");
    svg
}

/// Writes [`render_waterfall`] to a file.
pub fn render_waterfall_to_file(
    report: &BuildReport,
    path: impl AsRef<std::path::Path>,
) -> std::io::Result<()> {
    std::fs::write(path, render_waterfall(report))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::builder::{Action, Builder};

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_explain_new_target() {
        let (_guard, root) = scratch();
        std::fs::write(root.join("in"), "x").unwrap();

        let mut graph = Graph::new();
        let input = graph.file(root.join("in"));
        let out = graph.file(root.join("out"));
        graph
            .declare(Builder::new("cp", Action::command("cp $SOURCE $TARGET")), &[out], &[input])
            .unwrap();

        let store = SignatureStore::memory();
        let reasons = explain(&graph, &store, Decider::default(), out);
        assert_eq!(reasons, vec![Reason::TargetMissing, Reason::NoRecord]);
        assert!(explain(&graph, &store, Decider::default(), input).is_empty());
    }

    #[test]
    fn test_tree_prunes_repeated_subtrees() {
        let mut graph = Graph::new();
        let top = graph.alias("top");
        let left = graph.alias("left");
        let right = graph.alias("right");
        let shared = graph.alias("shared");
        let leaf = graph.value("leaf", b"1".to_vec());
        graph.depends(top, &[left, right]);
        graph.depends(left, &[shared]);
        graph.depends(right, &[shared]);
        graph.depends(shared, &[leaf]);

        let dump = tree(&graph, top);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].ends_with(" top"));
        assert!(lines[1].ends_with("  +-left"));
        assert!(lines[2].ends_with("    +-shared"));
        assert!(lines[3].ends_with("      +-leaf"));
        assert!(lines[4].ends_with("  +-right"));
        assert!(lines[5].ends_with("    +-[shared]"));
        // Aliases and values are virtual and always exist.
        assert!(lines[0].starts_with("[E      ]"));
    }

    #[test]
    fn test_mermaid_lists_nodes_and_edges() {
        let mut graph = Graph::new();
        let a = graph.alias("a");
        let b = graph.alias("b");
        graph.depends(a, &[b]);

        let mut report = BuildReport::default();
        report.execution_times.insert(
            "a".into(),
            TaskExecution {
                start: Instant::now(),
                duration: Duration::from_millis(3),
            },
        );

        let mermaid = render_mermaid(&graph, &report);
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains(&format!("{}[\"a\\n", a.index())));
        assert!(mermaid.contains(&format!("{} -- depends --> {}", b.index(), a.index())));
    }

    #[test]
    fn test_waterfall() {
        let report = BuildReport::default();
        assert!(render_waterfall(&report).contains("No tasks ran"));

        let mut report = BuildReport::default();
        let start = Instant::now();
        report.execution_times.insert(
            "<out>".into(),
            TaskExecution {
                start,
                duration: Duration::from_millis(5),
            },
        );
        let svg = render_waterfall(&report);
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("&lt;out&gt;"));
        assert!(svg.ends_with("</svg>"));
    }
}
