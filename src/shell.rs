//! Minimal POSIX shell word quoting and splitting
//!
//! Only what the Slurm wrapper scripts need: bare words, single quotes,
//! double quotes with backslash escapes, and backslash escapes outside quotes.
//! No expansion is performed, so `${job_ids[a]}` survives as literal text.

/// Quote a single word so the shell reads it back unchanged
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Quote and join a command line
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape text for embedding inside a double-quoted shell string
pub fn escape_double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Split a command line into words, honouring quotes and escapes
pub fn split(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated single quote in `{line}`")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek() {
                            Some(&next) if matches!(next, '\\' | '"' | '$' | '`') => {
                                current.push(next);
                                chars.next();
                            }
                            _ => current.push('\\'),
                        },
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated double quote in `{line}`")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_words_are_left_alone() {
        assert_eq!(quote("/bin/echo"), "/bin/echo");
        assert_eq!(quote("--mem=1024"), "--mem=1024");
    }

    #[test]
    fn unsafe_words_are_single_quoted() {
        assert_eq!(quote("Hello World"), "'Hello World'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn split_reverses_join() {
        let words = vec!["/bin/echo", "Hello World", "it's", "$HOME", ""];
        assert_eq!(split(&join(&words)).unwrap(), words);
    }

    #[test]
    fn split_handles_double_quotes_and_escapes() {
        let words = split(r#"--wrap="cd /tmp && echo \"hi\" \$x" plain\ word"#).unwrap();
        assert_eq!(words, vec![r#"--wrap=cd /tmp && echo "hi" $x"#, "plain word"]);
    }

    #[test]
    fn split_leaves_variable_references_intact() {
        let words = split("--dependency=afterok:${job_ids[a]}:${job_ids[b]}").unwrap();
        assert_eq!(words, vec!["--dependency=afterok:${job_ids[a]}:${job_ids[b]}"]);
    }

    #[test]
    fn unterminated_quotes_are_errors() {
        assert!(split("echo 'oops").is_err());
        assert!(split("echo \"oops").is_err());
    }

    #[test]
    fn double_quoted_escape_round_trips() {
        let inner = join(["echo", "it's $HOME"]);
        let line = format!("\"{}\"", escape_double_quoted(&inner));
        let outer = split(&line).unwrap();
        assert_eq!(split(&outer[0]).unwrap(), vec!["echo", "it's $HOME"]);
    }
}
