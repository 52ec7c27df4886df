//! Small helpers shared across modules.

use chrono::Local;

/// Substitute `#{name}` variables in a template, in a single left-to-right
/// pass over the input.
///
/// Values are copied verbatim into the output and never re-scanned, so a
/// value containing `#{...}` lookalikes cannot trigger further expansion and
/// substitution always terminates. Unknown variables pass through unchanged.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    'outer: while i < bytes.len() {
        if bytes[i] == b'#' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = template[i + 2..].find('}') {
                let name = &template[i + 2..i + 2 + end];
                for (var, value) in vars {
                    if *var == name {
                        out.push_str(value);
                        i += 2 + end + 1;
                        continue 'outer;
                    }
                }
            }
        }
        // Advance one whole character, not one byte
        let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }

    out
}

/// Current local time as `YYYY-MM-DD HH:MM:SS`, the format used for the
/// `#{time}` webhook variable.
pub fn local_time_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Current time as seconds since the Unix epoch.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_basic() {
        let out = substitute("hello #{name}!", &[("name", "world")]);
        assert_eq!(out, "hello world!");
    }

    #[test]
    fn substitute_repeated_variable() {
        let out = substitute("#{a} #{a}", &[("a", "x")]);
        assert_eq!(out, "x x");
    }

    #[test]
    fn substitute_value_containing_variable_token() {
        // A value that looks like a variable must not be expanded again.
        let out = substitute("v=#{a}", &[("a", "#{a}")]);
        assert_eq!(out, "v=#{a}");

        let out = substitute("#{a}#{b}", &[("a", "#{b}"), ("b", "B")]);
        assert_eq!(out, "#{b}B");
    }

    #[test]
    fn substitute_unknown_variable_passes_through() {
        let out = substitute("keep #{missing} here", &[("a", "x")]);
        assert_eq!(out, "keep #{missing} here");
    }

    #[test]
    fn substitute_unterminated_brace() {
        let out = substitute("tail #{oops", &[("oops", "x")]);
        assert_eq!(out, "tail #{oops");
    }

    #[test]
    fn substitute_multibyte_text() {
        let out = substitute("收件人: #{sender}", &[("sender", "+8613800138000")]);
        assert_eq!(out, "收件人: +8613800138000");
    }
}
