//! Tree evaluation with a hard step ceiling

use super::parse::{Command, Node, Operand, Pipeline};
use super::value::{TemplateVars, Value};
use crate::indexer::filters::{self, FilterContext};

/// Upper bound on evaluation steps for one expansion
pub const MAX_TEMPLATE_STEPS: usize = 10_000;

const FUNCTIONS: &[&str] = &[
    "and", "or", "not", "eq", "ne", "lt", "le", "gt", "ge", "index", "len", "printf", "join",
    "re_replace",
];

pub fn is_function(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

/// How values produced by actions are written into the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    None,
    /// Form-encoded in the definition's charset
    Form,
    /// Escaped for the inside of a JSON string literal
    Json,
}

impl Escape {
    fn apply(self, value: &str, ctx: &FilterContext, out: &mut String) {
        match self {
            Escape::None => out.push_str(value),
            Escape::Form => out.push_str(&filters::form_urlencode(value, ctx.encoding)),
            Escape::Json => {
                let quoted = serde_json::Value::String(value.to_string()).to_string();
                out.push_str(&quoted[1..quoted.len() - 1]);
            }
        }
    }
}

pub struct Evaluator<'a> {
    vars: &'a TemplateVars,
    ctx: FilterContext,
    escape: Escape,
    steps: usize,
    aborted: bool,
    dots: Vec<Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(vars: &'a TemplateVars, ctx: FilterContext, escape: Escape) -> Self {
        Self {
            vars,
            ctx,
            escape,
            steps: 0,
            aborted: false,
            dots: Vec::new(),
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    fn tick(&mut self) -> bool {
        if self.aborted {
            return false;
        }
        self.steps += 1;
        if self.steps > MAX_TEMPLATE_STEPS {
            tracing::warn!(steps = MAX_TEMPLATE_STEPS, "Template step limit exceeded, output truncated");
            self.aborted = true;
            return false;
        }
        true
    }

    pub fn render(&mut self, tree: &[Node], out: &mut String) {
        for node in tree {
            if !self.tick() {
                return;
            }
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Action(pipe) => {
                    let value = self.eval_pipeline(pipe).to_string();
                    self.escape.apply(&value, &self.ctx, out);
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let mut taken = false;
                    for (cond, body) in branches {
                        if self.eval_pipeline(cond).is_truthy() {
                            self.render(body, out);
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.render(otherwise, out);
                    }
                }
                Node::Range {
                    pipe,
                    body,
                    otherwise,
                } => {
                    let items = self.eval_pipeline(pipe).as_list();
                    if items.is_empty() {
                        self.render(otherwise, out);
                    }
                    for item in items {
                        if self.aborted {
                            break;
                        }
                        self.dots.push(item);
                        self.render(body, out);
                        self.dots.pop();
                    }
                }
            }
        }
    }

    pub fn eval_pipeline(&mut self, pipe: &Pipeline) -> Value {
        let mut acc: Option<Value> = None;
        for stage in &pipe.stages {
            acc = Some(self.eval_command(stage, acc));
        }
        acc.unwrap_or_default()
    }

    fn eval_command(&mut self, cmd: &Command, piped: Option<Value>) -> Value {
        if !self.tick() {
            return Value::Null;
        }
        match &cmd.head {
            Operand::Ident(name)
                if is_function(name) && !(piped.is_some() && filters::is_filter(name)) =>
            {
                let mut args: Vec<Value> = cmd.args.iter().map(|a| self.eval_operand(a)).collect();
                if let Some(v) = piped {
                    args.push(v);
                }
                call_function(name, args)
            }
            Operand::Ident(name) => {
                let Some(input) = piped else {
                    tracing::warn!(name = %name, "Unknown template function");
                    return Value::Null;
                };
                let args: Vec<String> = cmd
                    .args
                    .iter()
                    .map(|a| self.eval_operand(a).to_string())
                    .collect();
                let text = input.to_string();
                match filters::apply_filter(name, &args, &text, &self.ctx) {
                    Some(v) => Value::Str(v),
                    None => {
                        tracing::warn!(filter = %name, "Unknown filter in template, value passed through");
                        input
                    }
                }
            }
            head => self.eval_operand(head),
        }
    }

    fn eval_operand(&mut self, op: &Operand) -> Value {
        match op {
            Operand::Var(path) if path.is_empty() => self.dots.last().cloned().unwrap_or_default(),
            Operand::Var(path) => self.vars.get(path).cloned().unwrap_or_default(),
            Operand::Str(s) => Value::Str(s.clone()),
            Operand::Num(n) => Value::Num(*n),
            Operand::Bool(b) => Value::Bool(*b),
            Operand::Nil => Value::Null,
            Operand::Ident(w) => Value::Str(w.clone()),
            Operand::Sub(p) => self.eval_pipeline(p),
        }
    }
}

fn call_function(name: &str, args: Vec<Value>) -> Value {
    let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
    match name {
        "and" => {
            for a in &args {
                if !a.is_truthy() {
                    return a.clone();
                }
            }
            args.last().cloned().unwrap_or_default()
        }
        "or" => {
            for a in &args {
                if a.is_truthy() {
                    return a.clone();
                }
            }
            args.last().cloned().unwrap_or_default()
        }
        "not" => Value::Bool(!arg(0).is_truthy()),
        "eq" => {
            let first = arg(0);
            Value::Bool(args.iter().skip(1).any(|b| first.loose_eq(b)))
        }
        "ne" => Value::Bool(!arg(0).loose_eq(&arg(1))),
        "lt" => Value::Bool(arg(0).loose_cmp(&arg(1)).is_lt()),
        "le" => Value::Bool(arg(0).loose_cmp(&arg(1)).is_le()),
        "gt" => Value::Bool(arg(0).loose_cmp(&arg(1)).is_gt()),
        "ge" => Value::Bool(arg(0).loose_cmp(&arg(1)).is_ge()),
        "index" => {
            let mut current = arg(0);
            for idx in args.iter().skip(1) {
                let list = current.as_list();
                current = idx
                    .as_number()
                    .and_then(|n| if n >= 0.0 { list.get(n as usize).cloned() } else { None })
                    .unwrap_or_default();
            }
            current
        }
        "len" => Value::Num(arg(0).len() as f64),
        "printf" => Value::Str(printf(&arg(0).to_string(), &args[args.len().min(1)..])),
        "join" => {
            let sep = arg(1).to_string();
            let parts: Vec<String> = arg(0).as_list().iter().map(|v| v.to_string()).collect();
            Value::Str(parts.join(&sep))
        }
        "re_replace" => Value::Str(filters::re_replace(
            &arg(0).to_string(),
            &arg(1).to_string(),
            &arg(2).to_string(),
        )),
        _ => Value::Null,
    }
}

/// Minimal `printf`: `%s %v %d %f %q %x %%` with optional zero pad, width and precision
fn printf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut next_arg = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut zero = false;
        let mut left = false;
        while let Some(&f) = chars.peek() {
            match f {
                '0' => zero = true,
                '-' => left = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                p.push(d);
                chars.next();
            }
            precision = p.parse().ok();
        }
        let Some(verb) = chars.next() else {
            out.push('%');
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let value = next_arg.next().cloned().unwrap_or_default();
        let body = match verb {
            'd' => value
                .as_number()
                .map(|n| format!("{}", n as i64))
                .unwrap_or_else(|| value.to_string()),
            'f' => {
                let n = value.as_number().unwrap_or(0.0);
                format!("{:.*}", precision.unwrap_or(6), n)
            }
            'q' => format!("\"{}\"", value),
            'x' => value
                .as_number()
                .map(|n| format!("{:x}", n as i64))
                .unwrap_or_else(|| {
                    value.to_string().bytes().map(|b| format!("{:02x}", b)).collect()
                }),
            _ => value.to_string(),
        };
        let width: usize = width.parse().unwrap_or(0);
        let len = body.chars().count();
        if len >= width {
            out.push_str(&body);
        } else if left {
            out.push_str(&body);
            out.push_str(&" ".repeat(width - len));
        } else if zero && matches!(verb, 'd' | 'f' | 'x') {
            let (sign, digits) = match body.strip_prefix('-') {
                Some(d) => ("-", d.to_string()),
                None => ("", body.clone()),
            };
            out.push_str(sign);
            out.push_str(&"0".repeat(width - len));
            out.push_str(&digits);
        } else {
            out.push_str(&" ".repeat(width - len));
            out.push_str(&body);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printf() {
        assert_eq!(printf("S%02dE%02d", &[Value::Num(1.0), Value::Num(5.0)]), "S01E05");
        assert_eq!(printf("%s-%v", &[Value::from("a"), Value::from("b")]), "a-b");
        assert_eq!(printf("%.2f%%", &[Value::from("1.5")]), "1.50%");
        assert_eq!(printf("%q", &[Value::from("x")]), "\"x\"");
    }

    #[test]
    fn test_logic_functions() {
        assert_eq!(call_function("and", vec![Value::from("a"), Value::from("")]), Value::from(""));
        assert_eq!(call_function("or", vec![Value::from(""), Value::from("b")]), Value::from("b"));
        assert_eq!(call_function("eq", vec![Value::from("1"), Value::Num(1.0)]), Value::Bool(true));
        assert_eq!(
            call_function("eq", vec![Value::from("c"), Value::from("a"), Value::from("c")]),
            Value::Bool(true)
        );
        assert_eq!(call_function("lt", vec![Value::from("2"), Value::from("10")]), Value::Bool(true));
        assert_eq!(
            call_function("index", vec![Value::from(vec!["x", "y"]), Value::Num(1.0)]),
            Value::from("y")
        );
        assert_eq!(call_function("len", vec![Value::from("abc")]), Value::Num(3.0));
    }
}
