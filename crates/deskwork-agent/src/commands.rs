//! In-band control commands typed into the prompt box.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Approve(String),
    Deny(String),
    ApproveAll,
}

/// Recognizes `approve <id>`, `deny <id>` and `approve all`.
///
/// Matching ignores case and surrounding whitespace. Anything else,
/// including extra words, is an ordinary prompt.
pub fn parse_control_command(text: &str) -> Option<ControlCommand> {
    let mut words = text.split_whitespace();
    let verb = words.next()?.to_ascii_lowercase();
    let target = words.next()?;
    if words.next().is_some() {
        return None;
    }
    let target = target.to_ascii_lowercase();
    match verb.as_str() {
        "approve" if target == "all" => Some(ControlCommand::ApproveAll),
        "approve" => Some(ControlCommand::Approve(target)),
        "deny" => Some(ControlCommand::Deny(target)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn recognizes_the_three_commands() {
        assert_eq!(
            parse_control_command("approve 0190-ab"),
            Some(ControlCommand::Approve("0190-ab".to_string()))
        );
        assert_eq!(
            parse_control_command("  DENY  0190-AB "),
            Some(ControlCommand::Deny("0190-ab".to_string()))
        );
        assert_eq!(
            parse_control_command("Approve ALL"),
            Some(ControlCommand::ApproveAll)
        );
    }

    #[test]
    fn ordinary_prompts_are_not_commands() {
        for text in [
            "",
            "approve",
            "approve the plan please",
            "deny all of it",
            "Delete all logs",
            "approved 123",
        ] {
            assert_eq!(parse_control_command(text), None, "{text}");
        }
    }

    proptest! {
        #[test]
        fn approve_id_round_trips(id in "[a-f0-9-]{1,36}") {
            prop_assume!(id != "all");
            prop_assert_eq!(
                parse_control_command(&format!("approve {id}")),
                Some(ControlCommand::Approve(id.clone()))
            );
            prop_assert_eq!(
                parse_control_command(&format!("deny\t{id}\n")),
                Some(ControlCommand::Deny(id))
            );
        }

        #[test]
        fn three_or_more_words_never_parse(a in "[a-z]{1,8}", b in "[a-z]{1,8}", c in "[a-z]{1,8}") {
            prop_assert_eq!(parse_control_command(&format!("{a} {b} {c}")), None);
        }
    }
}
