//! ASCII tree rendering of a term.

use super::Term;

/// Renders the term tree, one node per line, children connected with
/// `├──`/`└──` and continued with `│` at a four-column indent.
pub(crate) fn render(term: &Term) -> String {
    let mut out = String::new();
    out.push_str(&label(term));
    out.push('\n');
    let children = children(term);
    for (i, child) in children.iter().enumerate() {
        render_node(child, "", i + 1 == children.len(), &mut out);
    }
    out
}

fn render_node(term: &Term, prefix: &str, is_last: bool, out: &mut String) {
    let connector = if is_last { "└── " } else { "├── " };
    out.push_str(prefix);
    out.push_str(connector);
    out.push_str(&label(term));
    out.push('\n');

    let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
    let children = children(term);
    for (i, child) in children.iter().enumerate() {
        render_node(child, &child_prefix, i + 1 == children.len(), out);
    }
}

fn label(term: &Term) -> String {
    match term {
        Term::Literal(s) => format!("Literal('{s}')"),
        Term::Regex(pattern) => format!("Regex('{pattern}')"),
        Term::JsonSchema { schema, .. } => format!("JsonSchema('{schema}')"),
        Term::KleeneStar(_) => "KleeneStar(*)".to_string(),
        Term::KleenePlus(_) => "KleenePlus(+)".to_string(),
        Term::Optional(_) => "Optional(?)".to_string(),
        Term::Alternatives(_) => "Alternatives(|)".to_string(),
        Term::Sequence(_) => "Sequence".to_string(),
        Term::QuantifyExact(_, n) => format!("Quantify({{{n}}})"),
        Term::QuantifyMinimum(_, m) => format!("Quantify({{{m},}})"),
        Term::QuantifyMaximum(_, n) => format!("Quantify({{0,{n}}})"),
        Term::QuantifyBetween(_, m, n) => format!("Quantify({{{m},{n}}})"),
        Term::Fsm(pattern) => format!("Fsm('{pattern}')"),
    }
}

fn children(term: &Term) -> Vec<&Term> {
    match term {
        Term::Literal(_) | Term::Regex(_) | Term::JsonSchema { .. } | Term::Fsm(_) => Vec::new(),
        Term::KleeneStar(inner)
        | Term::KleenePlus(inner)
        | Term::Optional(inner)
        | Term::QuantifyExact(inner, _)
        | Term::QuantifyMinimum(inner, _)
        | Term::QuantifyMaximum(inner, _)
        | Term::QuantifyBetween(inner, _, _) => vec![inner],
        Term::Alternatives(terms) | Term::Sequence(terms) => terms.iter().collect(),
    }
}
