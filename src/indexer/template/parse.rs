//! Tokenizer and parser for `{{ }}` templates

/// A parsed template
pub type Tree = Vec<Node>;

/// Deepest nesting of blocks and parentheses the parser accepts
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Action(Pipeline),
    If {
        branches: Vec<(Pipeline, Tree)>,
        otherwise: Tree,
    },
    Range {
        pipe: Pipeline,
        body: Tree,
        otherwise: Tree,
    },
}

/// `cmd | cmd | cmd`
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Command>,
}

/// One pipeline stage: a head operand followed by arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub head: Operand,
    pub args: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Dotted variable path. An empty path is the current dot
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Nil,
    /// Bare word: a function or filter name, or a bare filter argument
    Ident(String),
    Sub(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Str(String),
    Num(f64),
    Ident(String),
    Pipe,
    LParen,
    RParen,
}

#[derive(Debug)]
enum Item {
    Text(String),
    Action(Vec<Token>),
}

/// Parse a template into a tree
pub fn parse(template: &str) -> Result<Tree, String> {
    let items = split_items(template)?;
    let mut pos = 0;
    let (tree, terminator) = parse_block(&items, &mut pos, 0)?;
    match terminator {
        None => Ok(tree),
        Some(t) => Err(format!("unexpected {{{{ {} }}}}", t)),
    }
}

/// Split template text into literal text and tokenized actions,
/// honouring `{{-` and `-}}` whitespace trimming.
fn split_items(template: &str) -> Result<Vec<Item>, String> {
    let mut items = Vec::new();
    let mut rest = template;
    let mut trim_next_text = false;

    while let Some(start) = rest.find("{{") {
        let mut text = &rest[..start];
        if trim_next_text {
            text = text.trim_start();
        }
        let after_open = &rest[start + 2..];
        let trim_left = after_open.starts_with('-')
            && after_open[1..].starts_with(|c: char| c.is_whitespace());
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            items.push(Item::Text(text.to_string()));
        }

        let body_start = if trim_left { 1 } else { 0 };
        let end = find_close(&after_open[body_start..])
            .ok_or_else(|| "unclosed action".to_string())?;
        let mut body = &after_open[body_start..body_start + end];
        trim_next_text = false;
        if body.ends_with('-') && body[..body.len() - 1].ends_with(|c: char| c.is_whitespace()) {
            body = &body[..body.len() - 1];
            trim_next_text = true;
        }
        items.push(Item::Action(tokenize(body)?));
        rest = &after_open[body_start + end + 2..];
    }

    let text = if trim_next_text { rest.trim_start() } else { rest };
    if !text.is_empty() {
        items.push(Item::Text(text.to_string()));
    }
    Ok(items)
}

/// Byte offset of the closing `}}`, skipping string literals
fn find_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q == b'"' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn tokenize(body: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err("unterminated string".to_string());
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            let escaped = chars.get(i).copied().unwrap_or('\\');
                            i += 1;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                        }
                        other => s.push(other),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '`' => {
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err("unterminated raw string".to_string());
                    };
                    i += 1;
                    if c == '`' {
                        break;
                    }
                    s.push(c);
                }
                tokens.push(Token::Str(s));
            }
            '.' | '$' => {
                let start = i;
                i += 1;
                while i < chars.len() && is_path_char(chars[i]) {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let path = raw.trim_start_matches('$').trim_start_matches('.').to_string();
                tokens.push(Token::Var(path));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let n = raw
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", raw))?;
                tokens.push(Token::Num(n));
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '|' | '(' | ')' | '"' | '`')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Parse items until a control keyword (`else`, `end`) closes the block.
/// Returns the terminating action's tokens as a display string.
fn parse_block(items: &[Item], pos: &mut usize, depth: usize) -> Result<(Tree, Option<String>), String> {
    if depth > MAX_NESTING_DEPTH {
        return Err(format!("blocks nested deeper than {}", MAX_NESTING_DEPTH));
    }
    let mut tree = Vec::new();
    while *pos < items.len() {
        match &items[*pos] {
            Item::Text(t) => {
                tree.push(Node::Text(t.clone()));
                *pos += 1;
            }
            Item::Action(tokens) => match tokens.first() {
                Some(Token::Ident(kw)) if kw == "end" || kw == "else" => {
                    return Ok((tree, Some(kw.clone())));
                }
                Some(Token::Ident(kw)) if kw == "if" => {
                    let pipe = parse_pipeline(&tokens[1..])?;
                    *pos += 1;
                    tree.push(parse_if(items, pos, pipe, depth + 1)?);
                }
                Some(Token::Ident(kw)) if kw == "range" => {
                    let pipe = parse_pipeline(&tokens[1..])?;
                    *pos += 1;
                    tree.push(parse_range(items, pos, pipe, depth + 1)?);
                }
                Some(Token::Ident(kw)) if kw.starts_with("/*") => {
                    *pos += 1;
                }
                None => {
                    *pos += 1;
                }
                _ => {
                    tree.push(Node::Action(parse_pipeline(tokens)?));
                    *pos += 1;
                }
            },
        }
    }
    Ok((tree, None))
}

fn parse_if(items: &[Item], pos: &mut usize, first: Pipeline, depth: usize) -> Result<Node, String> {
    let mut branches = Vec::new();
    let mut cond = first;
    loop {
        let (body, term) = parse_block(items, pos, depth)?;
        branches.push((cond, body));
        match term.as_deref() {
            Some("end") => {
                *pos += 1;
                return Ok(Node::If {
                    branches,
                    otherwise: Vec::new(),
                });
            }
            Some("else") => {
                let tokens = match &items[*pos] {
                    Item::Action(t) => t,
                    Item::Text(_) => return Err("malformed else".to_string()),
                };
                *pos += 1;
                if matches!(tokens.get(1), Some(Token::Ident(k)) if k == "if") {
                    cond = parse_pipeline(&tokens[2..])?;
                    continue;
                }
                let (otherwise, term) = parse_block(items, pos, depth)?;
                if term.as_deref() != Some("end") {
                    return Err("missing {{ end }} after else".to_string());
                }
                *pos += 1;
                return Ok(Node::If {
                    branches,
                    otherwise,
                });
            }
            _ => return Err("missing {{ end }} for if".to_string()),
        }
    }
}

fn parse_range(items: &[Item], pos: &mut usize, pipe: Pipeline, depth: usize) -> Result<Node, String> {
    let (body, term) = parse_block(items, pos, depth)?;
    match term.as_deref() {
        Some("end") => {
            *pos += 1;
            Ok(Node::Range {
                pipe,
                body,
                otherwise: Vec::new(),
            })
        }
        Some("else") => {
            *pos += 1;
            let (otherwise, term) = parse_block(items, pos, depth)?;
            if term.as_deref() != Some("end") {
                return Err("missing {{ end }} for range".to_string());
            }
            *pos += 1;
            Ok(Node::Range {
                pipe,
                body,
                otherwise,
            })
        }
        _ => Err("missing {{ end }} for range".to_string()),
    }
}

fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline, String> {
    let mut i = 0;
    let pipe = parse_pipeline_at(tokens, &mut i, 0)?;
    if i != tokens.len() {
        return Err("unexpected ')'".to_string());
    }
    Ok(pipe)
}

fn parse_pipeline_at(tokens: &[Token], i: &mut usize, depth: usize) -> Result<Pipeline, String> {
    if depth > MAX_NESTING_DEPTH {
        return Err(format!("parentheses nested deeper than {}", MAX_NESTING_DEPTH));
    }
    let mut stages = Vec::new();
    let mut current: Vec<Operand> = Vec::new();

    while *i < tokens.len() {
        match &tokens[*i] {
            Token::RParen => break,
            Token::Pipe => {
                stages.push(make_command(std::mem::take(&mut current))?);
                *i += 1;
            }
            Token::LParen => {
                *i += 1;
                let sub = parse_pipeline_at(tokens, i, depth + 1)?;
                if tokens.get(*i) != Some(&Token::RParen) {
                    return Err("missing ')'".to_string());
                }
                *i += 1;
                current.push(Operand::Sub(sub));
            }
            Token::Var(p) => {
                current.push(Operand::Var(p.clone()));
                *i += 1;
            }
            Token::Str(s) => {
                current.push(Operand::Str(s.clone()));
                *i += 1;
            }
            Token::Num(n) => {
                current.push(Operand::Num(*n));
                *i += 1;
            }
            Token::Ident(w) => {
                current.push(match w.as_str() {
                    "true" => Operand::Bool(true),
                    "false" => Operand::Bool(false),
                    "nil" => Operand::Nil,
                    _ => Operand::Ident(w.clone()),
                });
                *i += 1;
            }
        }
    }
    stages.push(make_command(current)?);
    Ok(Pipeline { stages })
}

fn make_command(mut operands: Vec<Operand>) -> Result<Command, String> {
    if operands.is_empty() {
        return Err("empty command".to_string());
    }
    let head = operands.remove(0);
    Ok(Command {
        head,
        args: operands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_only() {
        assert_eq!(parse("abc").unwrap(), vec![Node::Text("abc".to_string())]);
    }

    #[test]
    fn test_parse_if_else_if() {
        let tree = parse("{{ if .A }}a{{ else if .B }}b{{ else }}c{{ end }}").unwrap();
        match &tree[0] {
            Node::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(otherwise, &vec![Node::Text("c".to_string())]);
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_parse_pipeline_with_sub() {
        let tree = parse(r#"{{ (eq .A "x") | not }}"#).unwrap();
        match &tree[0] {
            Node::Action(p) => {
                assert_eq!(p.stages.len(), 2);
                assert!(matches!(p.stages[0].head, Operand::Sub(_)));
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_trim_markers() {
        let tree = parse("a  {{- .X -}}  b").unwrap();
        assert_eq!(tree[0], Node::Text("a".to_string()));
        assert_eq!(tree[2], Node::Text("b".to_string()));
    }

    #[test]
    fn test_errors() {
        assert!(parse("{{ if .A }}x").is_err());
        assert!(parse("{{ .A ").is_err());
        assert!(parse("{{ end }}").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |n: usize| format!("{{{{ {}1{} }}}}", "(".repeat(n), ")".repeat(n));
        assert!(parse(&nested(MAX_NESTING_DEPTH)).is_ok());
        assert!(parse(&nested(MAX_NESTING_DEPTH + 1)).is_err());
        assert!(parse(&nested(20_000)).is_err());

        let ifs = |n: usize| format!("{}x{}", "{{ if .A }}".repeat(n), "{{ end }}".repeat(n));
        assert!(parse(&ifs(MAX_NESTING_DEPTH)).is_ok());
        assert!(parse(&ifs(20_000)).is_err());
    }

    #[test]
    fn test_close_inside_string() {
        let tree = parse(r#"{{ "}}" }}"#).unwrap();
        match &tree[0] {
            Node::Action(p) => assert_eq!(p.stages[0].head, Operand::Str("}}".to_string())),
            other => panic!("unexpected node {:?}", other),
        }
    }
}
