/// Score extracted from a conventional competitive-programming checker
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedScore {
    Score(u32),
    Failed { message: String },
}

/// Classifies a checker message by its prefix:
///
/// - `ok …` scores 100;
/// - `wrong answer …` and `wrong output format …` score 0;
/// - `points N` scores N for N in `[0, 100]`;
/// - `partially correct (N)` scores ⌊N/2⌋ for N in `[0, 200]`;
/// - `FAIL …` is a judgement failure carrying the message;
/// - anything else is a judgement failure with a parse note.
pub fn parse_checker_message(message: &str) -> ParsedScore {
    let trimmed = message.trim_start();

    if trimmed.starts_with("ok") {
        return ParsedScore::Score(100);
    }

    if trimmed.starts_with("wrong answer") || trimmed.starts_with("wrong output format") {
        return ParsedScore::Score(0);
    }

    if let Some(rest) = trimmed.strip_prefix("points ") {
        return match parse_leading_number(rest) {
            Some(points) if (0.0..=100.0).contains(&points) => {
                ParsedScore::Score(points.round() as u32)
            }
            Some(points) => {
                ParsedScore::Failed { message: format!("The reported score {points} is out of range") }
            }
            None => couldnt_parse(message),
        };
    }

    if let Some(rest) = trimmed.strip_prefix("partially correct (") {
        return match rest.split_once(')').and_then(|(number, _)| number.trim().parse::<f64>().ok())
        {
            Some(points) if (0.0..=200.0).contains(&points) => {
                ParsedScore::Score((points / 2.0).floor() as u32)
            }
            Some(points) => {
                ParsedScore::Failed { message: format!("The reported score {points} is out of range") }
            }
            None => couldnt_parse(message),
        };
    }

    if trimmed.starts_with("FAIL") {
        return ParsedScore::Failed { message: trimmed.to_string() };
    }

    couldnt_parse(message)
}

fn parse_leading_number(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

fn couldnt_parse(message: &str) -> ParsedScore {
    let excerpt: String = message.trim().chars().take(256).collect();
    ParsedScore::Failed { message: format!("Couldn't parse the checker's message: {excerpt}") }
}

#[cfg(test)]
mod tests {
    use super::{parse_checker_message, ParsedScore};

    #[test]
    fn test_ok() {
        assert_eq!(parse_checker_message("ok 3 numbers"), ParsedScore::Score(100));
        assert_eq!(parse_checker_message("ok"), ParsedScore::Score(100));
    }

    #[test]
    fn test_wrong_answer() {
        assert_eq!(parse_checker_message("wrong answer 1st number differ"), ParsedScore::Score(0));
        assert_eq!(
            parse_checker_message("wrong output format Expected integer"),
            ParsedScore::Score(0)
        );
    }

    #[test]
    fn test_points() {
        assert_eq!(parse_checker_message("points 73"), ParsedScore::Score(73));
        assert_eq!(parse_checker_message("points 0"), ParsedScore::Score(0));
        assert!(matches!(parse_checker_message("points 101"), ParsedScore::Failed { .. }));
    }

    #[test]
    fn test_partially_correct() {
        assert_eq!(parse_checker_message("partially correct (150)"), ParsedScore::Score(75));
        assert_eq!(parse_checker_message("partially correct (120) close"), ParsedScore::Score(60));
        assert!(matches!(parse_checker_message("partially correct (201)"), ParsedScore::Failed { .. }));
    }

    #[test]
    fn test_fail() {
        match parse_checker_message("FAIL the answer file is broken") {
            ParsedScore::Failed { message } => assert!(message.starts_with("FAIL")),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_gibberish() {
        match parse_checker_message("gibberish") {
            ParsedScore::Failed { message } => {
                assert!(message.starts_with("Couldn't parse the checker's message"))
            }
            other => panic!("Unexpected result: {other:?}"),
        }
    }
}
