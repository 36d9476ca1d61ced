//! Kernel signature extraction from OpenCL C source.
//!
//! Only the declarations are understood: bodies are skipped by brace
//! matching and never interpreted.

use crate::types::{AddressQualifier, ScalarKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSignature {
    pub name: String,
    /// Native spelling, e.g. `float*` or `uint`.
    pub type_name: String,
    pub pointer: bool,
    pub address: AddressQualifier,
}

impl ParamSignature {
    /// Byte size a value argument must have, when the base type is a known scalar.
    pub fn value_size(&self) -> Option<usize> {
        if self.pointer {
            return None;
        }
        ScalarKind::from_c_name(&self.type_name).map(ScalarKind::size_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<ParamSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Punct(char),
}

/// Parse every kernel declaration in `source`.
///
/// Errors are human-readable diagnostics suitable for a build log.
pub fn parse_kernels(source: &str) -> Result<Vec<KernelSignature>, String> {
    let cleaned = strip_comments(source)?;
    let tokens = tokenize(&cleaned);
    let mut kernels = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if is_word(&tokens[i], &["__kernel", "kernel"]) {
            let (sig, next) = parse_declaration(&tokens, i + 1)?;
            if kernels.iter().any(|k: &KernelSignature| k.name == sig.name) {
                return Err(format!("error: redefinition of kernel '{}'", sig.name));
            }
            kernels.push(sig);
            i = next;
        } else {
            i += 1;
        }
    }
    Ok(kernels)
}

fn strip_comments(source: &str) -> Result<String, String> {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut closed = false;
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err("error: unterminated /* comment".to_string());
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in source.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(&mut word)));
        }
        if !c.is_whitespace() {
            tokens.push(Token::Punct(c));
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

fn is_word(token: &Token, options: &[&str]) -> bool {
    matches!(token, Token::Word(w) if options.contains(&w.as_str()))
}

/// Index just past the group closing the `open` at `start`.
fn skip_group(tokens: &[Token], start: usize, open: char, close: char) -> Result<usize, String> {
    if tokens.get(start) != Some(&Token::Punct(open)) {
        return Err(format!("error: expected '{open}'"));
    }
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(start) {
        match token {
            Token::Punct(c) if *c == open => depth += 1,
            Token::Punct(c) if *c == close => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
    }
    Err(format!("error: expected '{close}'"))
}

fn parse_declaration(tokens: &[Token], mut i: usize) -> Result<(KernelSignature, usize), String> {
    // Attributes may appear before the return type.
    while i < tokens.len() && is_word(&tokens[i], &["__attribute__"]) {
        i = skip_group(tokens, i + 1, '(', ')')?;
    }
    match tokens.get(i) {
        Some(t) if is_word(t, &["void"]) => i += 1,
        Some(Token::Word(w)) => return Err(format!("error: kernel must return void, found '{w}'")),
        _ => return Err("error: expected kernel return type".to_string()),
    }
    let name = match tokens.get(i) {
        Some(Token::Word(w)) => w.clone(),
        _ => return Err("error: expected kernel name".to_string()),
    };
    i += 1;
    if tokens.get(i) != Some(&Token::Punct('(')) {
        return Err(format!("error: expected '(' after kernel '{name}'"));
    }
    let close = skip_group(tokens, i, '(', ')')
        .map_err(|e| format!("{e} in parameter list of kernel '{name}'"))?;
    let params = parse_params(&tokens[i + 1..close - 1])
        .map_err(|e| format!("{e} in kernel '{name}'"))?;
    let mut next = close;
    if tokens.get(next) == Some(&Token::Punct('{')) {
        next = skip_group(tokens, next, '{', '}')
            .map_err(|e| format!("{e} at end of kernel '{name}'"))?;
    }
    Ok((KernelSignature { name, params }, next))
}

fn parse_params(tokens: &[Token]) -> Result<Vec<ParamSignature>, String> {
    if tokens.is_empty() || (tokens.len() == 1 && is_word(&tokens[0], &["void"])) {
        return Ok(Vec::new());
    }
    tokens
        .split(|t| *t == Token::Punct(','))
        .enumerate()
        .map(|(index, param)| parse_param(param, index))
        .collect()
}

fn parse_param(tokens: &[Token], index: usize) -> Result<ParamSignature, String> {
    let mut address = None;
    let mut pointer = false;
    let mut words: Vec<&str> = Vec::new();
    for token in tokens {
        match token {
            Token::Punct('*') => {
                if pointer {
                    return Err(format!("error: parameter {index}: pointer-to-pointer not allowed"));
                }
                pointer = true;
            }
            Token::Punct(c) => {
                return Err(format!("error: parameter {index}: unexpected '{c}'"));
            }
            Token::Word(w) => match w.as_str() {
                "__global" | "global" => address = Some(AddressQualifier::Global),
                "__local" | "local" => address = Some(AddressQualifier::Local),
                "__constant" | "constant" => address = Some(AddressQualifier::Constant),
                "__private" | "private" => address = Some(AddressQualifier::Private),
                "const" | "volatile" | "restrict" | "__restrict" | "__read_only" | "read_only"
                | "__write_only" | "write_only" | "__read_write" | "read_write" => {}
                other => words.push(other),
            },
        }
    }
    let Some((name, base)) = words.split_last() else {
        return Err(format!("error: parameter {index}: missing type"));
    };
    if base.is_empty() {
        return Err(format!("error: parameter {index}: missing name after type '{name}'"));
    }
    let base = normalize_type(base);
    let type_name = if pointer { format!("{base}*") } else { base };
    Ok(ParamSignature {
        name: (*name).to_string(),
        type_name,
        pointer,
        address: address.unwrap_or(AddressQualifier::Private),
    })
}

fn normalize_type(words: &[&str]) -> String {
    match words {
        ["unsigned"] | ["unsigned", "int"] => "uint".to_string(),
        ["unsigned", "char"] => "uchar".to_string(),
        ["unsigned", "short"] => "ushort".to_string(),
        ["unsigned", "long"] => "ulong".to_string(),
        _ => words.join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_pointer_and_value_params() {
        let src = r#"
            // doubles every element
            __kernel void scale(__global float* data, const float factor, uint n) {
                size_t i = get_global_id(0);
                if (i < n) { data[i] *= factor; }
            }
        "#;
        let kernels = parse_kernels(src).unwrap();
        assert_eq!(kernels.len(), 1);
        let k = &kernels[0];
        assert_eq!(k.name, "scale");
        assert_eq!(k.params.len(), 3);
        assert_eq!(k.params[0].type_name, "float*");
        assert_eq!(k.params[0].address, AddressQualifier::Global);
        assert!(k.params[0].pointer);
        assert_eq!(k.params[1].type_name, "float");
        assert_eq!(k.params[1].address, AddressQualifier::Private);
        assert_eq!(k.params[2].value_size(), Some(4));
    }

    #[test]
    fn normalizes_unsigned_spellings() {
        let src = "kernel void k(global unsigned char *a, unsigned int b, local unsigned *c) {}";
        let k = &parse_kernels(src).unwrap()[0];
        assert_eq!(k.params[0].type_name, "uchar*");
        assert_eq!(k.params[1].type_name, "uint");
        assert_eq!(k.params[2].type_name, "uint*");
        assert_eq!(k.params[2].address, AddressQualifier::Local);
    }

    #[test]
    fn multiple_kernels_and_block_comments() {
        let src = "/* kernel void hidden(int x) {} */\n\
                   __kernel void a(void) {}\n\
                   __kernel __attribute__((reqd_work_group_size(64, 1, 1))) void b(__constant double* c) { if (1) { } }";
        let kernels = parse_kernels(src).unwrap();
        let names: Vec<_> = kernels.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(kernels[0].params.is_empty());
        assert_eq!(kernels[1].params[0].address, AddressQualifier::Constant);
    }

    #[test]
    fn unknown_scalar_type_has_no_value_size() {
        let k = &parse_kernels("kernel void k(float4 v) {}").unwrap()[0];
        assert_eq!(k.params[0].type_name, "float4");
        assert_eq!(k.params[0].value_size(), None);
    }

    #[test]
    fn errors_are_diagnostics() {
        assert!(parse_kernels("kernel int k() {}").unwrap_err().contains("void"));
        assert!(parse_kernels("kernel void k(float* ) {}").unwrap_err().contains("missing name"));
        assert!(parse_kernels("kernel void k(float a").unwrap_err().contains("')'"));
        assert!(parse_kernels("/* open").unwrap_err().contains("unterminated"));
        assert!(parse_kernels("kernel void k() {} kernel void k() {}")
            .unwrap_err()
            .contains("redefinition"));
    }
}
