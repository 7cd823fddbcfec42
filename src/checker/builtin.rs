use std::path::Path;

use anyhow::{Context, Result};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, BufReader},
};

/// Native renditions of the four built-in checkers. Each returns a
/// conventional checker message (`ok …` / `wrong answer …` / `FAIL …`) which
/// the caller feeds through the message parser.
pub async fn run_builtin_checker(
    kind: BuiltinChecker,
    output_path: &Path,
    answer_path: &Path,
) -> Result<String> {
    match kind {
        BuiltinChecker::Integers => {
            let output = read_text(output_path).await?;
            let answer = read_text(answer_path).await?;
            Ok(check_integers(&output, &answer))
        }
        BuiltinChecker::Floats { precision } => {
            let output = read_text(output_path).await?;
            let answer = read_text(answer_path).await?;
            Ok(check_floats(&output, &answer, precision))
        }
        BuiltinChecker::Lines { case_sensitive } => {
            let output = read_text(output_path).await?;
            let answer = read_text(answer_path).await?;
            Ok(check_lines(&output, &answer, case_sensitive))
        }
        BuiltinChecker::Binary => check_binary(output_path, answer_path).await,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BuiltinChecker {
    Integers,
    Floats { precision: u32 },
    Lines { case_sensitive: bool },
    Binary,
}

async fn read_text(path: &Path) -> Result<String> {
    let data = fs::read(path).await.with_context(|| format!("Error reading {}", path.display()))?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

fn check_integers(output: &str, answer: &str) -> String {
    let mut output_tokens = output.split_ascii_whitespace();
    let mut answer_tokens = answer.split_ascii_whitespace();

    let mut n = 0usize;
    let mut first_elements = String::new();

    loop {
        let (answer_token, output_token) = match (answer_tokens.next(), output_tokens.next()) {
            (Some(a), Some(o)) => (a, o),
            (Some(_), None) => {
                let extra = 1 + answer_tokens.count();
                return format!(
                    "wrong answer Output is shorter than answer - expected {} elements but found \
                     {} elements",
                    n + extra,
                    n
                );
            }
            (None, Some(_)) => {
                let extra = 1 + output_tokens.count();
                return format!(
                    "wrong answer Output is longer than answer - expected {} elements but found \
                     {} elements",
                    n,
                    n + extra
                );
            }
            (None, None) => break,
        };

        n += 1;

        let expected: i64 = match answer_token.parse() {
            Ok(value) => value,
            Err(_) => {
                return format!(
                    "FAIL Expected integer in the answer, but \"{}\" found",
                    compress(answer_token)
                )
            }
        };
        let found: i64 = match output_token.parse() {
            Ok(value) => value,
            Err(_) => {
                return format!(
                    "wrong output format Expected integer, but \"{}\" found",
                    compress(output_token)
                )
            }
        };

        if expected != found {
            return format!(
                "wrong answer {n}{} number differ - expected: '{expected}', found: '{found}'",
                english_ending(n)
            );
        }

        if n <= 5 {
            if !first_elements.is_empty() {
                first_elements.push(' ');
            }
            first_elements.push_str(&expected.to_string());
        }
    }

    if n <= 5 {
        format!("ok {n} number(s): \"{}\"", compress(&first_elements))
    } else {
        format!("ok {n} numbers")
    }
}

fn check_floats(output: &str, answer: &str, precision: u32) -> String {
    let eps = 10f64.powi(-(precision as i32));

    let mut output_tokens = output.split_ascii_whitespace();
    let mut answer_tokens = answer.split_ascii_whitespace();

    let mut n = 0usize;

    loop {
        let (answer_token, output_token) = match (answer_tokens.next(), output_tokens.next()) {
            (Some(a), Some(o)) => (a, o),
            (Some(_), None) => {
                let extra = 1 + answer_tokens.count();
                return format!(
                    "wrong answer Output is shorter than answer - expected {} elements but found \
                     {} elements",
                    n + extra,
                    n
                );
            }
            (None, Some(_)) => {
                let extra = 1 + output_tokens.count();
                return format!(
                    "wrong answer Output is longer than answer - expected {} elements but found \
                     {} elements",
                    n,
                    n + extra
                );
            }
            (None, None) => break,
        };

        n += 1;

        let expected: f64 = match answer_token.parse() {
            Ok(value) => value,
            Err(_) => {
                return format!(
                    "FAIL Expected double in the answer, but \"{}\" found",
                    compress(answer_token)
                )
            }
        };
        let found: f64 = match output_token.parse() {
            Ok(value) => value,
            Err(_) => {
                return format!(
                    "wrong output format Expected double, but \"{}\" found",
                    compress(output_token)
                )
            }
        };

        if !double_compare(expected, found, eps) {
            return format!(
                "wrong answer {n}{} number differ - expected: '{expected:.10}', found: \
                 '{found:.10}', error = '{:.10}'",
                english_ending(n),
                double_delta(expected, found),
            );
        }
    }

    format!("ok {n} numbers")
}

/// Accepted iff the absolute or the relative error stays within `eps`.
fn double_compare(expected: f64, result: f64, eps: f64) -> bool {
    let difference = (expected - result).abs();
    difference <= eps || difference <= eps * expected.abs().max(result.abs())
}

fn double_delta(expected: f64, result: f64) -> f64 {
    let absolute = (expected - result).abs();
    if expected.abs() > 1e-9 {
        let relative = (absolute / expected).abs();
        if relative < absolute {
            return relative;
        }
    }
    absolute
}

fn check_lines(output: &str, answer: &str, case_sensitive: bool) -> String {
    let answer_lines: Vec<&str> = answer.lines().collect();
    let output_lines: Vec<&str> = output.lines().collect();

    let mut n = 0usize;
    let mut answer_trailing_empty = 0usize;
    let mut output_trailing_empty = 0usize;
    let mut last_answer_line = String::new();

    while n < answer_lines.len() || n < output_lines.len() {
        let answer_line = match answer_lines.get(n) {
            None => {
                answer_trailing_empty += 1;
                ""
            }
            Some(line) => {
                let line = line.trim_end_matches([' ', '\u{c}', '\t', '\r', '\u{b}', '\n']);
                if line.is_empty() {
                    answer_trailing_empty += 1;
                } else {
                    last_answer_line = line.to_string();
                    answer_trailing_empty = 0;
                }
                line
            }
        };

        let output_line = match output_lines.get(n) {
            None => {
                output_trailing_empty += 1;
                ""
            }
            Some(line) => {
                let line = line.trim_end_matches([' ', '\u{c}', '\t', '\r', '\u{b}', '\n']);
                if line.is_empty() {
                    output_trailing_empty += 1;
                } else {
                    output_trailing_empty = 0;
                }
                line
            }
        };

        n += 1;

        let equal = if case_sensitive {
            answer_line == output_line
        } else {
            answer_line.eq_ignore_ascii_case(output_line)
        };
        if !equal {
            return format!(
                "wrong answer {n}{} line differ - expected: '{}', found: '{}'",
                english_ending(n),
                compress(answer_line),
                compress(output_line)
            );
        }
    }

    let answer_count = n - answer_trailing_empty;
    let output_count = n - output_trailing_empty;

    if answer_count > output_count {
        return format!(
            "wrong answer Output is shorter than answer - expected {answer_count} lines but \
             found {output_count} lines"
        );
    }
    if output_count > answer_count {
        return format!(
            "wrong answer Output is longer than answer - expected {output_count} lines but found \
             {answer_count} lines"
        );
    }

    if answer_count == 1 {
        format!("ok single line: '{}'", compress(&last_answer_line))
    } else {
        format!("ok {n} lines")
    }
}

async fn check_binary(output_path: &Path, answer_path: &Path) -> Result<String> {
    let output_len = fs::metadata(output_path).await?.len();
    let answer_len = fs::metadata(answer_path).await?.len();

    if answer_len > output_len {
        return Ok(format!(
            "wrong answer Output is shorter than answer - expected {answer_len} bytes but found \
             {output_len} bytes"
        ));
    }
    if output_len > answer_len {
        return Ok(format!(
            "wrong answer Output is longer than answer - expected {answer_len} bytes but found \
             {output_len} bytes"
        ));
    }

    let mut output = BufReader::new(File::open(output_path).await?);
    let mut answer = BufReader::new(File::open(answer_path).await?);

    const BUFFER_SIZE: usize = 64 * 1024;
    let mut output_buffer = vec![0u8; BUFFER_SIZE];
    let mut answer_buffer = vec![0u8; BUFFER_SIZE];
    let mut position = 0usize;

    loop {
        let output_count = output.read(&mut output_buffer).await?;
        let answer_count = answer.read(&mut answer_buffer).await?;

        if output_count != answer_count {
            return Ok(format!(
                "FAIL Read {output_count} bytes from output but read {answer_count} bytes from \
                 answer"
            ));
        }
        if output_count == 0 {
            break;
        }

        for i in 0..output_count {
            position += 1;
            if output_buffer[i] != answer_buffer[i] {
                return Ok(format!(
                    "wrong answer {position}{} byte differ - expected: '{:#04x}', found: \
                     '{:#04x}'",
                    english_ending(position),
                    answer_buffer[i],
                    output_buffer[i]
                ));
            }
        }
    }

    Ok(format!("ok {answer_len} byte(s)"))
}

fn english_ending(n: usize) -> &'static str {
    if (11..=13).contains(&(n % 100)) {
        return "th";
    }
    match n % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

/// Excerpts long values the way testlib does, keeping both ends.
fn compress(text: &str) -> String {
    const LIMIT: usize = 64;
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= LIMIT {
        return text.to_string();
    }

    let head: String = chars[..30].iter().collect();
    let tail: String = chars[chars.len() - 31..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_accepts_whitespace_differences() {
        assert!(check_integers("1 2   3", "1\n2\n3\n").starts_with("ok"));
        assert_eq!(check_integers("1 2 3", "1 2 3"), "ok 3 number(s): \"1 2 3\"");
    }

    #[test]
    fn test_integers_mismatch() {
        assert_eq!(
            check_integers("1 5 3", "1 2 3"),
            "wrong answer 2nd number differ - expected: '2', found: '5'"
        );
    }

    #[test]
    fn test_integers_length_mismatch() {
        assert_eq!(
            check_integers("1 2", "1 2 3"),
            "wrong answer Output is shorter than answer - expected 3 elements but found 2 elements"
        );
        assert_eq!(
            check_integers("1 2 3 4", "1 2 3"),
            "wrong answer Output is longer than answer - expected 3 elements but found 4 elements"
        );
    }

    #[test]
    fn test_integers_bad_token() {
        assert!(check_integers("1 x 3", "1 2 3").starts_with("wrong output format"));
        assert!(check_integers("1 2 3", "1 y 3").starts_with("FAIL"));
    }

    #[test]
    fn test_floats_tolerance() {
        // 1e-4 error is within 10^-3.
        assert!(check_floats("1.0001", "1.0", 3).starts_with("ok"));
        assert!(check_floats("1.01", "1.0", 3).starts_with("wrong answer"));
        // Relative tolerance admits large values.
        assert!(check_floats("1000.5", "1000.0", 3).starts_with("ok"));
    }

    #[test]
    fn test_lines_trailing_whitespace_and_empty_lines() {
        assert!(check_lines("a \nb\t\n\n\n", "a\nb", true).starts_with("ok"));
        assert_eq!(check_lines("a\nb", "a\nb", true), "ok 2 lines");
    }

    #[test]
    fn test_lines_case_folding() {
        assert!(check_lines("Hello", "hello", false).starts_with("ok"));
        assert!(check_lines("Hello", "hello", true).starts_with("wrong answer"));
    }

    #[test]
    fn test_lines_single_line_message() {
        assert_eq!(check_lines("answer", "answer", true), "ok single line: 'answer'");
    }

    #[test]
    fn test_lines_length_mismatch() {
        assert_eq!(
            check_lines("a", "a\nb", true),
            "wrong answer 2nd line differ - expected: 'b', found: ''"
        );
    }

    #[tokio::test]
    async fn test_binary_equal_and_differ() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("a");
        let b = root.path().join("b");

        tokio::fs::write(&a, b"abc").await.unwrap();
        tokio::fs::write(&b, b"abc").await.unwrap();
        assert_eq!(check_binary(&a, &b).await.unwrap(), "ok 3 byte(s)");

        tokio::fs::write(&a, b"abd").await.unwrap();
        assert_eq!(
            check_binary(&a, &b).await.unwrap(),
            "wrong answer 3rd byte differ - expected: '0x63', found: '0x64'"
        );

        tokio::fs::write(&a, b"ab").await.unwrap();
        assert_eq!(
            check_binary(&a, &b).await.unwrap(),
            "wrong answer Output is shorter than answer - expected 3 bytes but found 2 bytes"
        );
    }

    #[test]
    fn test_english_ending() {
        assert_eq!(english_ending(1), "st");
        assert_eq!(english_ending(2), "nd");
        assert_eq!(english_ending(3), "rd");
        assert_eq!(english_ending(4), "th");
        assert_eq!(english_ending(11), "th");
        assert_eq!(english_ending(12), "th");
        assert_eq!(english_ending(21), "st");
        assert_eq!(english_ending(111), "th");
    }

    #[test]
    fn test_compress() {
        let long = "x".repeat(100);
        let compressed = compress(&long);
        assert_eq!(compressed.len(), 64);
        assert!(compressed.contains("..."));
        assert_eq!(compress("short"), "short");
    }
}
