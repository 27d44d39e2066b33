//! Built-in aggregation macros
//!
//! A node whose payload is code (`@name(args...)` in a task file) runs one
//! of these in-process instead of launching a shell command. The registry
//! is fixed: the call names a macro, arguments are literals (strings,
//! numbers, lists) and the current node is the implicit subject. Arbitrary
//! code execution is deliberately not supported.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::descr::Params;
use crate::error::{RelabError, Result};

/// Names the evaluator accepts
pub const MACRO_LIST: [&str; 5] = [
    "output_list",
    "annotated_list",
    "parameter_map",
    "all_map",
    "percentiles",
];

/// What a macro may see of one parent
#[derive(Debug, Clone)]
pub struct ParentView {
    pub description: String,
    pub results_dir: PathBuf,
    pub params: Params,
}

/// The slice of the current node a macro operates on
#[derive(Debug)]
pub struct MacroContext {
    /// This node's results directory; macros write their outputs here
    pub results_dir: PathBuf,
    /// Parents in parent order
    pub parents: Vec<ParentView>,
    /// Base for resolving relative input paths
    pub base_dir: PathBuf,
}

/// A literal macro argument
#[derive(Debug, Clone, PartialEq)]
pub enum MacroArg {
    Num(f64),
    Str(String),
    List(Vec<MacroArg>),
}

impl MacroArg {
    fn as_str(&self) -> Result<&str> {
        match self {
            MacroArg::Str(s) => Ok(s),
            other => Err(macro_err(format!("expected a string, got {other:?}"))),
        }
    }

    fn as_num(&self) -> Result<f64> {
        match self {
            MacroArg::Num(n) => Ok(*n),
            other => Err(macro_err(format!("expected a number, got {other:?}"))),
        }
    }

    fn as_str_list(&self) -> Result<Vec<&str>> {
        match self {
            MacroArg::List(items) => items.iter().map(MacroArg::as_str).collect(),
            other => Err(macro_err(format!("expected a list, got {other:?}"))),
        }
    }
}

fn macro_err(details: impl Into<String>) -> RelabError {
    RelabError::Macro {
        details: details.into(),
    }
}

pub fn is_known(name: &str) -> bool {
    MACRO_LIST.contains(&name)
}

/// Evaluate a `name(arg, ...)` call against the current node.
///
/// Returns the value recorded as the node's return code.
pub fn evaluate(code: &str, ctx: &MacroContext) -> Result<i32> {
    let (name, args) = parse_call(code)?;
    if !is_known(&name) {
        return Err(macro_err(format!("unknown macro: {name}")));
    }
    info!(macro_name = %name, "running macro");

    match name.as_str() {
        "output_list" => {
            expect_arity(&args, 0, &name)?;
            output_list(ctx)
        }
        "annotated_list" => {
            expect_arity(&args, 1, &name)?;
            annotated_list(ctx, args[0].as_str()?)
        }
        "parameter_map" => {
            expect_arity(&args, 1, &name)?;
            parameter_map(ctx, args[0].as_str()?)
        }
        "all_map" => {
            expect_arity(&args, 2, &name)?;
            all_map(ctx, args[0].as_str()?, args[1].as_str()?)
        }
        "percentiles" => {
            expect_arity(&args, 6, &name)?;
            percentiles(
                ctx,
                args[0].as_str()?,
                args[1].as_str()?,
                &args[2].as_str_list()?,
                args[3].as_str()?,
                args[4].as_num()?,
                args[5].as_num()?,
            )
        }
        _ => unreachable!("is_known checked above"),
    }?;
    Ok(0)
}

fn expect_arity(args: &[MacroArg], want: usize, name: &str) -> Result<()> {
    if args.len() != want {
        return Err(macro_err(format!(
            "{name} takes {want} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Write each parent's results path to `<self>/out`, one per line
fn output_list(ctx: &MacroContext) -> Result<()> {
    let mut f = File::create(ctx.results_dir.join("out"))?;
    for parent in &ctx.parents {
        writeln!(f, "{}", parent.results_dir.display())?;
    }
    Ok(())
}

/// As `output_list`, each line prefixed with the parent's value of `param`
fn annotated_list(ctx: &MacroContext, param: &str) -> Result<()> {
    let mut f = File::create(ctx.results_dir.join("annot_out"))?;
    for parent in &ctx.parents {
        let value = parent_param(parent, param)?;
        writeln!(f, "{value} : {}", parent.results_dir.display())?;
    }
    Ok(())
}

/// For each parent, pair its value of `param` with the first line of its
/// `out` file; one `<value> <line>` row per parent in `<self>/param_out`.
fn parameter_map(ctx: &MacroContext, param: &str) -> Result<()> {
    let mut f = File::create(ctx.results_dir.join("param_out"))?;
    for parent in &ctx.parents {
        let value = parent_param(parent, param)?;
        let line = first_line(&parent.results_dir.join("out"), &parent.description)?;
        writeln!(f, "{value} {line}")?;
    }
    Ok(())
}

/// Tabulate every parent's parameters and the first line of its `infile`
/// into `<self>/<outfile>`, with a header row naming the columns.
fn all_map(ctx: &MacroContext, infile: &str, outfile: &str) -> Result<()> {
    let mut f = File::create(ctx.results_dir.join(outfile))?;
    let mut wrote_header = false;
    for parent in &ctx.parents {
        let line = first_line(&parent.results_dir.join(infile), &parent.description)?;
        if !wrote_header {
            write!(f, "# ")?;
            for key in parent.params.keys() {
                write!(f, "{key} ")?;
            }
            writeln!(f, "output_val")?;
            wrote_header = true;
        }
        for value in parent.params.values() {
            match value.as_str() {
                Some(s) => write!(f, "\"{s}\" ")?,
                None => write!(f, "{value} ")?,
            }
        }
        writeln!(f, "{line}")?;
    }
    Ok(())
}

/// Group the rows of a space-separated table by the `xcols` values and emit
/// the low, median and high percentiles of `ycol` per group.
///
/// Percentile arguments of 1 or more are read as percentages (95 means
/// 0.95). The input's header row may carry a leading `#`, as written by
/// `all_map`.
fn percentiles(
    ctx: &MacroContext,
    infile: &str,
    outfile: &str,
    xcols: &[&str],
    ycol: &str,
    low: f64,
    high: f64,
) -> Result<()> {
    let low = if low >= 1.0 { low / 100.0 } else { low };
    let high = if high >= 1.0 { high / 100.0 } else { high };

    let in_path = if Path::new(infile).is_absolute() {
        PathBuf::from(infile)
    } else {
        ctx.base_dir.join(infile)
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .from_path(&in_path)
        .map_err(|e| macro_err(format!("could not open '{}': {e}", in_path.display())))?;

    let mut records = reader.records();
    let header = records
        .next()
        .ok_or_else(|| macro_err(format!("'{infile}' is empty")))?
        .map_err(|e| macro_err(e.to_string()))?;
    let colnames: Vec<String> = header
        .iter()
        .skip(usize::from(header.get(0) == Some("#")))
        .map(str::to_string)
        .collect();

    let col_index = |name: &str| -> Result<usize> {
        colnames
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| macro_err(format!("no column '{name}' in '{infile}'")))
    };
    let x_indices: Vec<usize> = xcols.iter().map(|c| col_index(c)).collect::<Result<_>>()?;
    let y_index = col_index(ycol)?;

    let mut groups: std::collections::BTreeMap<String, Vec<f64>> = Default::default();
    for record in records {
        let record = record.map_err(|e| macro_err(e.to_string()))?;
        let label = x_indices
            .iter()
            .map(|&i| record.get(i).unwrap_or("").to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let y: f64 = record
            .get(y_index)
            .unwrap_or("")
            .parse()
            .map_err(|_| macro_err(format!("non-numeric value in column '{ycol}'")))?;
        groups.entry(label).or_default().push(y);
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .from_path(ctx.results_dir.join(outfile))
        .map_err(|e| macro_err(e.to_string()))?;
    for (idx, (label, mut values)) in groups.into_iter().enumerate() {
        values.sort_by(f64::total_cmp);
        let pick = |q: f64| values[((values.len() as f64 * q) as usize).min(values.len() - 1)];
        let (bottom, med, top) = (pick(low), pick(0.5), pick(high));
        writer
            .write_record([
                idx.to_string(),
                label,
                med.to_string(),
                bottom.to_string(),
                top.to_string(),
            ])
            .map_err(|e| macro_err(e.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

fn parent_param<'a>(parent: &'a ParentView, param: &str) -> Result<&'a crate::descr::ParamValue> {
    parent.params.get(param).ok_or_else(|| {
        macro_err(format!(
            "job '{}' has no parameter '{param}'",
            parent.description
        ))
    })
}

fn first_line(path: &Path, description: &str) -> Result<String> {
    let file = File::open(path).map_err(|_| {
        macro_err(format!(
            "could not open output file '{}' from job '{description}'",
            path.display()
        ))
    })?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

/// Parse `name(arg, arg, ...)` with literal arguments.
pub fn parse_call(code: &str) -> Result<(String, Vec<MacroArg>)> {
    let code = code.trim();
    let open = code
        .find('(')
        .ok_or_else(|| macro_err(format!("not a macro call: {code}")))?;
    if !code.ends_with(')') {
        return Err(macro_err(format!("unterminated macro call: {code}")));
    }
    let name = code[..open].trim().to_string();
    if name.is_empty() {
        return Err(macro_err(format!("not a macro call: {code}")));
    }
    let body = &code[open + 1..code.len() - 1];
    Ok((name, parse_args(body)?))
}

fn parse_args(body: &str) -> Result<Vec<MacroArg>> {
    let mut args = Vec::new();
    for piece in split_top_level(body) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        args.push(parse_literal(piece)?);
    }
    Ok(args)
}

fn parse_literal(piece: &str) -> Result<MacroArg> {
    if let Some(inner) = piece
        .strip_prefix('\'')
        .and_then(|p| p.strip_suffix('\''))
        .or_else(|| piece.strip_prefix('"').and_then(|p| p.strip_suffix('"')))
    {
        return Ok(MacroArg::Str(inner.to_string()));
    }
    if let Some(inner) = piece.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
        return Ok(MacroArg::List(parse_args(inner)?));
    }
    if let Ok(n) = piece.parse::<f64>() {
        return Ok(MacroArg::Num(n));
    }
    // bare word, taken as a string
    Ok(MacroArg::Str(piece.to_string()))
}

/// Split on commas outside quotes and brackets
fn split_top_level(body: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in body.chars() {
        match c {
            '\'' | '"' => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    _ => {}
                }
                current.push(c);
            }
            '[' if quote.is_none() => {
                depth += 1;
                current.push(c);
            }
            ']' if quote.is_none() => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if quote.is_none() && depth == 0 => {
                pieces.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descr::ParamValue;
    use std::fs;

    fn ctx_with_parents(parents: Vec<ParentView>) -> (tempfile::TempDir, MacroContext) {
        let tmp = tempfile::tempdir().unwrap();
        let results_dir = tmp.path().join("self");
        fs::create_dir_all(&results_dir).unwrap();
        let base_dir = tmp.path().to_path_buf();
        (
            tmp,
            MacroContext {
                results_dir,
                parents,
                base_dir,
            },
        )
    }

    fn parent(tmp: &Path, name: &str, params: &[(&str, ParamValue)]) -> ParentView {
        let dir = tmp.join(name);
        fs::create_dir_all(&dir).unwrap();
        let mut p = Params::new();
        for (k, v) in params {
            p.insert((*k).to_string(), v.clone());
        }
        ParentView {
            description: name.to_string(),
            results_dir: dir,
            params: p,
        }
    }

    #[test]
    fn parse_plain_call() {
        let (name, args) = parse_call("output_list()").unwrap();
        assert_eq!(name, "output_list");
        assert!(args.is_empty());
    }

    #[test]
    fn parse_mixed_arguments() {
        let (name, args) =
            parse_call("percentiles('in', 'out', [a, b], 'y', 5, 95)").unwrap();
        assert_eq!(name, "percentiles");
        assert_eq!(args.len(), 6);
        assert_eq!(args[0], MacroArg::Str("in".into()));
        assert_eq!(
            args[2],
            MacroArg::List(vec![MacroArg::Str("a".into()), MacroArg::Str("b".into())])
        );
        assert_eq!(args[4], MacroArg::Num(5.0));
    }

    #[test]
    fn parse_rejects_non_calls() {
        assert!(parse_call("no parens").is_err());
        assert!(parse_call("broken(").is_err());
    }

    #[test]
    fn unknown_macro_fails() {
        let (_tmp, ctx) = ctx_with_parents(vec![]);
        assert!(evaluate("launch_missiles()", &ctx).is_err());
    }

    #[test]
    fn wrong_arity_fails() {
        let (_tmp, ctx) = ctx_with_parents(vec![]);
        assert!(evaluate("output_list(1)", &ctx).is_err());
        assert!(evaluate("annotated_list()", &ctx).is_err());
    }

    #[test]
    fn output_list_writes_parent_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let p1 = parent(tmp.path(), "p1", &[]);
        let p2 = parent(tmp.path(), "p2", &[]);
        let (_tmp2, ctx) = ctx_with_parents(vec![p1.clone(), p2.clone()]);
        assert_eq!(evaluate("output_list()", &ctx).unwrap(), 0);
        let out = fs::read_to_string(ctx.results_dir.join("out")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], p1.results_dir.display().to_string());
        assert_eq!(lines[1], p2.results_dir.display().to_string());
    }

    #[test]
    fn annotated_list_prefixes_param_value() {
        let tmp = tempfile::tempdir().unwrap();
        let p = parent(tmp.path(), "p", &[("rate", ParamValue::Float(0.5))]);
        let (_tmp2, ctx) = ctx_with_parents(vec![p.clone()]);
        evaluate("annotated_list('rate')", &ctx).unwrap();
        let out = fs::read_to_string(ctx.results_dir.join("annot_out")).unwrap();
        assert_eq!(
            out.trim_end(),
            format!("0.5 : {}", p.results_dir.display())
        );
    }

    #[test]
    fn parameter_map_pairs_value_with_first_out_line() {
        let tmp = tempfile::tempdir().unwrap();
        let p = parent(tmp.path(), "p", &[("n", ParamValue::Int(3))]);
        fs::write(p.results_dir.join("out"), "42.5\nsecond line\n").unwrap();
        let (_tmp2, ctx) = ctx_with_parents(vec![p]);
        evaluate("parameter_map('n')", &ctx).unwrap();
        let out = fs::read_to_string(ctx.results_dir.join("param_out")).unwrap();
        assert_eq!(out.trim_end(), "3 42.5");
    }

    #[test]
    fn parameter_map_fails_on_missing_out() {
        let tmp = tempfile::tempdir().unwrap();
        let p = parent(tmp.path(), "p", &[("n", ParamValue::Int(3))]);
        let (_tmp2, ctx) = ctx_with_parents(vec![p]);
        assert!(evaluate("parameter_map('n')", &ctx).is_err());
    }

    #[test]
    fn all_map_tabulates_with_header() {
        let tmp = tempfile::tempdir().unwrap();
        let p1 = parent(
            tmp.path(),
            "p1",
            &[("n", ParamValue::Int(1)), ("opt", ParamValue::Str("sgd".into()))],
        );
        let p2 = parent(
            tmp.path(),
            "p2",
            &[("n", ParamValue::Int(2)), ("opt", ParamValue::Str("adam".into()))],
        );
        fs::write(p1.results_dir.join("out"), "0.91\n").unwrap();
        fs::write(p2.results_dir.join("out"), "0.87\n").unwrap();
        let (_tmp2, ctx) = ctx_with_parents(vec![p1, p2]);
        evaluate("all_map('out', 'table')", &ctx).unwrap();
        let out = fs::read_to_string(ctx.results_dir.join("table")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "# n opt output_val");
        assert_eq!(lines[1], "1 \"sgd\" 0.91");
        assert_eq!(lines[2], "2 \"adam\" 0.87");
    }

    #[test]
    fn percentiles_groups_and_ranks() {
        let (_tmp, ctx) = ctx_with_parents(vec![]);
        let table = "\
# size latency
a 1
a 2
a 3
a 4
b 10
";
        fs::write(ctx.base_dir.join("table"), table).unwrap();
        evaluate(
            "percentiles('table', 'pct', [size], 'latency', 25, 75)",
            &ctx,
        )
        .unwrap();
        let out = fs::read_to_string(ctx.results_dir.join("pct")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        // idx label median bottom top
        assert_eq!(lines[0], "0 a 3 2 4");
        assert_eq!(lines[1], "1 b 10 10 10");
    }
}
