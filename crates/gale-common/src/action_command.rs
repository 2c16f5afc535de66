// Workflow-command parsing: `::command key=val,key2=val2::data` lines emitted
// by steps on stdout. A line is only a command when `::` starts at column 0;
// anywhere else it is plain output.

use std::collections::{HashMap, HashSet};

/// A parsed workflow command.
#[derive(Debug, Clone)]
pub struct ActionCommand {
    /// The command name (e.g. "set-output", "add-mask").
    pub command: String,
    /// Key-value properties attached to the command.
    pub properties: HashMap<String, String>,
    /// The command data / body text.
    pub data: String,
}

/// The command delimiter, used both as prefix and as separator.
pub const COMMAND_KEY: &str = "::";

// ---------------------------------------------------------------------------
// Escape mappings
// ---------------------------------------------------------------------------

struct EscapeMapping {
    token: &'static str,
    replacement: &'static str,
}

/// Data escape mappings.
const ESCAPE_DATA_MAPPINGS: &[EscapeMapping] = &[
    EscapeMapping { token: "\r", replacement: "%0D" },
    EscapeMapping { token: "\n", replacement: "%0A" },
    EscapeMapping { token: "%",  replacement: "%25" },
];

/// Property escape mappings.
const ESCAPE_PROPERTY_MAPPINGS: &[EscapeMapping] = &[
    EscapeMapping { token: "\r", replacement: "%0D" },
    EscapeMapping { token: "\n", replacement: "%0A" },
    EscapeMapping { token: ":",  replacement: "%3A" },
    EscapeMapping { token: ",",  replacement: "%2C" },
    EscapeMapping { token: "%",  replacement: "%25" },
];

impl ActionCommand {
    /// Create a new `ActionCommand` with the given command name.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            properties: HashMap::new(),
            data: String::new(),
        }
    }

    /// Try to parse a workflow command from an output line.
    ///
    /// The format is `::command-name key=value,key2=value2::body data`.
    /// The leading `::` must be at column 0. `registered_commands` is the set
    /// of recognised command names; unrecognised names return `None` so the
    /// line is treated as plain output.
    pub fn try_parse(
        line: &str,
        registered_commands: &HashSet<String>,
    ) -> Option<ActionCommand> {
        if !line.starts_with(COMMAND_KEY) {
            return None;
        }

        // Find the second `::` that separates command info from data.
        let after_prefix = &line[COMMAND_KEY.len()..];
        let end_index = after_prefix.find(COMMAND_KEY)?;

        let cmd_info = &after_prefix[..end_index];

        // Command name ends at the first space; the rest is properties.
        let (command_name, properties_str) = match cmd_info.find(' ') {
            Some(space) => (&cmd_info[..space], Some(cmd_info[space + 1..].trim())),
            None => (cmd_info, None),
        };

        if !registered_commands.contains(command_name) {
            return None;
        }

        let mut command = ActionCommand::new(command_name);

        // Properties: `key=value,key2=value2`
        if let Some(props) = properties_str {
            for entry in props.split(',') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                if let Some(eq) = entry.find('=') {
                    let key = &entry[..eq];
                    let value = &entry[eq + 1..];
                    if !key.is_empty() && !value.is_empty() {
                        command
                            .properties
                            .insert(key.to_string(), unescape_property(value));
                    }
                }
            }
        }

        // Data is everything after the second `::`.
        let data_start = COMMAND_KEY.len() + end_index + COMMAND_KEY.len();
        command.data = unescape_data(&line[data_start..]);

        Some(command)
    }

    /// Escape a value for emission as command data.
    pub fn escape_data(value: &str) -> String {
        if value.is_empty() {
            return String::new();
        }
        let mut escaped = value.to_string();
        // `%` first so already-escaped sequences are not double-encoded.
        for mapping in ESCAPE_DATA_MAPPINGS.iter().rev() {
            escaped = escaped.replace(mapping.token, mapping.replacement);
        }
        escaped
    }
}

// ---------------------------------------------------------------------------
// Unescape helpers
// ---------------------------------------------------------------------------

fn unescape_property(escaped: &str) -> String {
    if escaped.is_empty() {
        return String::new();
    }
    let mut result = escaped.to_string();
    for mapping in ESCAPE_PROPERTY_MAPPINGS {
        result = result.replace(mapping.replacement, mapping.token);
    }
    result
}

fn unescape_data(escaped: &str) -> String {
    if escaped.is_empty() {
        return String::new();
    }
    let mut result = escaped.to_string();
    for mapping in ESCAPE_DATA_MAPPINGS {
        result = result.replace(mapping.replacement, mapping.token);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_simple() {
        let cmds = commands(&["error"]);
        let cmd = ActionCommand::try_parse("::error::something went wrong", &cmds).unwrap();
        assert_eq!(cmd.command, "error");
        assert_eq!(cmd.data, "something went wrong");
        assert!(cmd.properties.is_empty());
    }

    #[test]
    fn test_parse_with_properties() {
        let cmds = commands(&["warning"]);
        let cmd =
            ActionCommand::try_parse("::warning file=app.js,line=10::check this", &cmds).unwrap();
        assert_eq!(cmd.command, "warning");
        assert_eq!(cmd.data, "check this");
        assert_eq!(cmd.properties.get("file").map(String::as_str), Some("app.js"));
        assert_eq!(cmd.properties.get("line").map(String::as_str), Some("10"));
    }

    #[test]
    fn test_set_output_form() {
        let cmds = commands(&["set-output"]);
        let cmd = ActionCommand::try_parse("::set-output name=k::v", &cmds).unwrap();
        assert_eq!(cmd.command, "set-output");
        assert_eq!(cmd.properties.get("name").map(String::as_str), Some("k"));
        assert_eq!(cmd.data, "v");
    }

    #[test]
    fn test_not_at_column_zero_is_plain_output() {
        let cmds = commands(&["error"]);
        assert!(ActionCommand::try_parse("  ::error::indented", &cmds).is_none());
        assert!(ActionCommand::try_parse("prefix ::error::embedded", &cmds).is_none());
    }

    #[test]
    fn test_unregistered_command() {
        let cmds = commands(&["warning"]);
        assert!(ActionCommand::try_parse("::error::data", &cmds).is_none());
    }

    #[test]
    fn test_unescape_data() {
        let cmds = commands(&["error"]);
        let cmd = ActionCommand::try_parse("::error::line1%0Aline2%0D%25done", &cmds).unwrap();
        assert_eq!(cmd.data, "line1\nline2\r%done");
    }

    #[test]
    fn test_unescape_property() {
        let cmds = commands(&["error"]);
        let cmd = ActionCommand::try_parse("::error file=a%2Cb%3Ac::msg", &cmds).unwrap();
        assert_eq!(cmd.properties.get("file").map(String::as_str), Some("a,b:c"));
    }

    #[test]
    fn test_escape_data_round_trip() {
        let escaped = ActionCommand::escape_data("multi\nline % text");
        assert_eq!(escaped, "multi%0Aline %25 text");
        assert_eq!(unescape_data(&escaped), "multi\nline % text");
    }

    #[test]
    fn test_empty_line() {
        let cmds = commands(&["error"]);
        assert!(ActionCommand::try_parse("", &cmds).is_none());
    }

    #[test]
    fn test_missing_terminator() {
        let cmds = commands(&["error"]);
        assert!(ActionCommand::try_parse("::error no terminator", &cmds).is_none());
    }
}
