//! Symbol aggregation.
//!
//! The `symbol` key of an entity is never written by commands directly; it
//! resolves by combining its reserved parts in a fixed order:
//!
//! | order | part          | wrapper                              |
//! |-------|---------------|--------------------------------------|
//! | 1     | `text`        | the base                             |
//! | 2     | `over`        | `<mover>base part</mover>`           |
//! | 3     | `subscript`   | `<msub>base part</msub>`             |
//! | 4     | `superscript` | `<msup>base part</msup>`             |
//! | 5     | `arguments`   | `<mrow>base<mfenced>part</mfenced></mrow>` |
//!
//! Each part may hold several blocks (a list value and/or numerically
//! indexed children); they are joined with `,` inside one `<mrow>`.

use crate::arena::DepId;
use crate::dependency::{Dependency, DependencyGraph, KeyPath};
use crate::value::Datum;
use tracing::trace;

/// Root key of an entity's rendered symbol.
pub const SYMBOL_KEY: &str = "symbol";

/// Reserved sub-keys of `symbol`, in nesting order.
pub const SYMBOL_PARTS: [&str; 5] = ["text", "over", "subscript", "superscript", "arguments"];

/// `<mi>` markup for an identifier.
pub fn identifier(name: &str) -> String {
    format!("<mi>{}</mi>", escape(name))
}

/// `<mn>` markup for a number.
pub fn number(n: f64) -> String {
    format!("<mn>{}</mn>", Datum::Number(n))
}

/// Wraps markup in `<mfenced>`.
pub fn fence(markup: &str) -> String {
    format!("<mfenced>{markup}</mfenced>")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            c => out.push(c),
        }
    }
    out
}

/// Nests the given `(part, blocks)` pairs. Parts must be in
/// [`SYMBOL_PARTS`] order; empty parts are skipped. Returns `None` when
/// there is nothing to render.
pub fn render<'a, I>(parts: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, Vec<String>)>,
{
    let mut symbol: Option<String> = None;
    for (part, blocks) in parts {
        if blocks.is_empty() {
            continue;
        }
        let row = format!("<mrow>{}</mrow>", blocks.join(","));
        let base = symbol.take().unwrap_or_default();
        symbol = Some(match part {
            "over" => format!("<mover>{base}{row}</mover>"),
            "subscript" => format!("<msub>{base}{row}</msub>"),
            "superscript" => format!("<msup>{base}{row}</msup>"),
            "arguments" => format!("<mrow>{base}<mfenced>{}</mfenced></mrow>", blocks.join(",")),
            _ => format!("{base}{row}"),
        });
    }
    symbol
}

/// Blocks of one part: its own (list) value, then indexed children in
/// numeric order.
fn part_blocks(dep: &Dependency, path: &KeyPath) -> Vec<String> {
    let mut blocks = dep
        .key(path)
        .and_then(|m| m.value())
        .map(Datum::blocks)
        .unwrap_or_default();
    let mut indexed: Vec<(usize, KeyPath)> = dep
        .children(path)
        .into_iter()
        .filter_map(|c| c.last().and_then(|s| s.parse().ok()).map(|n| (n, c.clone())))
        .collect();
    indexed.sort();
    for (_, child) in indexed {
        if let Some(value) = dep.key(&child).and_then(|m| m.value()) {
            blocks.extend(value.blocks());
        }
    }
    blocks
}

impl DependencyGraph {
    /// Resolution hook of the `symbol` key of a data tree.
    pub(crate) fn aggregate_symbol(&mut self, dep: DepId) {
        let root = KeyPath::from_segments([SYMBOL_KEY]);
        let rendered = {
            let Some(d) = self.get(dep) else {
                return;
            };
            render(
                SYMBOL_PARTS
                    .iter()
                    .map(|part| (*part, part_blocks(d, &root.child(*part)))),
            )
        };
        trace!(dep = %dep, symbol = rendered.as_deref().unwrap_or(""), "aggregated symbol");
        if let Some(meta) = self.get_mut(dep).and_then(|d| d.key_mut(&root)) {
            meta.value = rendered.map(Datum::Text);
        }
    }

    /// Resolved symbol markup of a data tree.
    pub fn symbol(&self, dep: DepId) -> Option<String> {
        let root = KeyPath::from_segments([SYMBOL_KEY]);
        self.get(dep)?
            .key(&root)
            .filter(|m| m.is_propagated())
            .and_then(|m| m.value())
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(text: &str, sub: &str, sup: &str) -> Vec<(&'static str, Vec<String>)> {
        let one = |s: &str| if s.is_empty() { vec![] } else { vec![s.to_string()] };
        vec![
            ("text", one(text)),
            ("over", vec![]),
            ("subscript", one(sub)),
            ("superscript", one(sup)),
            ("arguments", vec![]),
        ]
    }

    #[test]
    fn subscript_nests_inside_superscript() {
        assert_eq!(
            render(parts("x", "1", "2")).as_deref(),
            Some("<msup><msub><mrow>x</mrow><mrow>1</mrow></msub><mrow>2</mrow></msup>")
        );
    }

    #[test]
    fn arguments_are_fenced_and_joined() {
        let symbol = render(vec![
            ("text", vec!["<mi>f</mi>".to_string()]),
            ("arguments", vec!["<mi>x</mi>".to_string(), "<mi>y</mi>".to_string()]),
        ]);
        assert_eq!(
            symbol.as_deref(),
            Some("<mrow><mrow><mi>f</mi></mrow><mfenced><mi>x</mi>,<mi>y</mi></mfenced></mrow>")
        );
        assert_eq!(render(parts("", "", "")), None);
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(identifier("a<b"), "<mi>a&lt;b</mi>");
        assert_eq!(number(-0.0), "<mn>0</mn>");
        assert_eq!(number(2.5), "<mn>2.5</mn>");
    }
}
