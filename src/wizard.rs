//! The scripted login driver and the markers it prints.
//!
//! The assistant's login flow is a full-screen terminal program. An `expect` script drives
//! it inside the sandbox, prints plain-text markers for each milestone and writes its final
//! verdict to a result file for callers that are no longer attached to its output.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

pub const SCRIPT_PATH: &str = "/tmp/claude_setup.exp";
pub const CODE_FILE: &str = "verification_code.txt";
pub const RESULT_FILE: &str = "auth_result.txt";

pub const AUTH_URL_FOUND: &str = "AUTH_URL_FOUND";
pub const WAITING_FOR_CODE: &str = "WAITING_FOR_CODE";
pub const CODE_PROMPT_READY: &str = "CODE_PROMPT_READY";
pub const ALREADY_AUTHENTICATED: &str = "ALREADY_AUTHENTICATED";
pub const SETUP_ERROR: &str = "SETUP_ERROR";
pub const CODE_RECEIVED: &str = "CODE_RECEIVED";
pub const CODE_SUBMITTED: &str = "CODE_SUBMITTED";
pub const CODE_ERROR: &str = "CODE_ERROR";
pub const TIMEOUT_WAITING_FOR_CODE_FILE: &str = "TIMEOUT_WAITING_FOR_CODE_FILE";
pub const AUTHENTICATION_SUCCESS: &str = "AUTHENTICATION_SUCCESS";

const SUCCESS_MARKERS: &[&str] = &[
    AUTHENTICATION_SUCCESS,
    "authentication setup completed successfully",
];
const ERROR_MARKERS: &[&str] = &[
    SETUP_ERROR,
    CODE_ERROR,
    TIMEOUT_WAITING_FOR_CODE_FILE,
    "invalid",
    "incorrect",
    "failed",
];

/// Bytes of recent output kept for marker matching across chunk boundaries.
const WINDOW_LIMIT: usize = 8 * 1024;

const SCRIPT_TEMPLATE: &str = r#"#!/usr/bin/expect -f
set timeout 60
set comm_dir "@SIGNAL_DIR@"
set code_file "$comm_dir/verification_code.txt"
set result_file "$comm_dir/auth_result.txt"

proc verdict {path text} {
    catch {
        set fh [open $path w]
        puts $fh $text
        close $fh
        file attributes $path -permissions 0666
    }
}

proc give_up {marker detail} {
    global result_file
    puts "$marker $detail"
    verdict $result_file $marker
    exit 1
}

spawn @ASSISTANT@

expect {
    -re {already.*authenticated} {
        puts "ALREADY_AUTHENTICATED"
        verdict $result_file "ALREADY_AUTHENTICATED"
        exit 0
    }
    -re {text style.*:} { send "\r" }
    timeout { give_up "SETUP_ERROR" "no style prompt" }
    eof { give_up "SETUP_ERROR" "assistant exited early" }
}

expect {
    -re {login method.*:|authentication.*:} { send "\r" }
    timeout { give_up "SETUP_ERROR" "no login method prompt" }
    eof { give_up "SETUP_ERROR" "assistant exited early" }
}

expect {
    -re {(https?://[^\s\x00-\x1f]+)} {
        puts "AUTH_URL_FOUND: $expect_out(1,string)"
        puts "WAITING_FOR_CODE"
    }
    -re {Paste code here|verification code|Enter code} {
        puts "CODE_PROMPT_READY"
    }
    -re {already.*authenticated} {
        puts "ALREADY_AUTHENTICATED"
        verdict $result_file "ALREADY_AUTHENTICATED"
        exit 0
    }
    -re {error|failed|invalid} { give_up "SETUP_ERROR" "login flow reported an error" }
    timeout { give_up "SETUP_ERROR" "no sign-in url" }
    eof { give_up "SETUP_ERROR" "assistant exited early" }
}

set code ""
for {set i 0} {$i < 1500} {incr i} {
    if {[file readable $code_file]} {
        if {![catch {open $code_file r} fh]} {
            set code [string trim [read $fh]]
            close $fh
            catch {file delete $code_file}
            if {$code ne ""} { break }
        }
    }
    after 200
}
if {$code eq ""} { give_up "TIMEOUT_WAITING_FOR_CODE_FILE" "" }

puts "CODE_RECEIVED"
foreach ch [split $code ""] {
    send -- $ch
    after 50
}
send "\r"
puts "CODE_SUBMITTED"

expect {
    -re {successful} { send "\r" }
    -re {error|failed|invalid|incorrect} { give_up "CODE_ERROR" "code rejected" }
    timeout { give_up "CODE_ERROR" "no confirmation" }
    eof { give_up "CODE_ERROR" "assistant exited after the code" }
}
expect {
    -re {Security notes} { send "\r" }
    timeout {}
}
expect {
    -re {trust.*files} { send "\r" }
    timeout {}
}
send "\003"
after 500
send "\003"
after 1000

puts "AUTHENTICATION_SUCCESS"
verdict $result_file "AUTHENTICATION_SUCCESS"
exit 0
"#;

pub fn render_script(assistant_binary: &str, signal_dir: &str) -> String {
    SCRIPT_TEMPLATE
        .replace("@SIGNAL_DIR@", signal_dir.trim_end_matches('/'))
        .replace("@ASSISTANT@", assistant_binary)
}

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ansi pattern"));
static MARKED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"AUTH_URL_FOUND:\s*(https?://[^\s\x00-\x1f]+)[\s\x00-\x1f]")
        .expect("valid marker pattern")
});
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(https?://[^\s\x00-\x1f]+)[\s\x00-\x1f]").expect("valid url pattern")
});

/// Finds a complete sign-in URL in raw terminal output.
///
/// A URL only counts once something terminates it, so a URL split across two reads is
/// never returned truncated. The driver's marker line wins over URLs printed by the
/// assistant itself.
pub fn find_auth_url(output: &str) -> Option<String> {
    let text = ANSI_ESCAPE.replace_all(output, " ");
    [&*MARKED_URL, &*BARE_URL]
        .into_iter()
        .flat_map(|pattern| pattern.captures_iter(&text).collect::<Vec<_>>())
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str())
        .find(|candidate| {
            Url::parse(candidate)
                .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
                .unwrap_or(false)
        })
        .map(str::to_string)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupSignal {
    Url(String),
    AlreadyAuthenticated,
    Completed,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifySignal {
    Success,
    Failure(String),
}

/// Rolling view over a driver's output.
#[derive(Debug, Default)]
pub struct MarkerWindow {
    text: String,
    acknowledged: bool,
}

impl MarkerWindow {
    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.contains(CODE_RECEIVED) {
            self.acknowledged = true;
        }
        if self.text.len() > WINDOW_LIMIT {
            let mut cut = self.text.len() - WINDOW_LIMIT;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// First milestone of a login that is still waiting for its sign-in URL.
    pub fn setup_signal(&self) -> Option<SetupSignal> {
        if self.text.contains(ALREADY_AUTHENTICATED) {
            return Some(SetupSignal::AlreadyAuthenticated);
        }
        if self.text.contains(AUTHENTICATION_SUCCESS) {
            return Some(SetupSignal::Completed);
        }
        if let Some(url) = find_auth_url(&self.text) {
            return Some(SetupSignal::Url(url));
        }
        [SETUP_ERROR, TIMEOUT_WAITING_FOR_CODE_FILE]
            .into_iter()
            .find(|marker| self.text.contains(marker))
            .map(|marker| SetupSignal::Failed(excerpt(&self.text, marker)))
    }

    /// Outcome of a submitted code, if the output already decides it.
    pub fn verify_signal(&self) -> Option<VerifySignal> {
        classify_verdict(&self.text)
    }
}

/// Decides between the success and error markers, whichever appears first.
pub fn classify_verdict(text: &str) -> Option<VerifySignal> {
    let lower = text.to_lowercase();
    let first = |markers: &[&'static str]| {
        markers
            .iter()
            .filter_map(|marker| lower.find(&marker.to_lowercase()).map(|at| (at, *marker)))
            .min_by_key(|(at, _)| *at)
    };
    match (first(SUCCESS_MARKERS), first(ERROR_MARKERS)) {
        (Some((ok_at, _)), Some((err_at, marker))) if err_at < ok_at => {
            Some(VerifySignal::Failure(excerpt(text, marker)))
        }
        (Some(_), _) => Some(VerifySignal::Success),
        (None, Some((_, marker))) => Some(VerifySignal::Failure(excerpt(text, marker))),
        (None, None) => None,
    }
}

/// The line holding `marker`, for error messages.
fn excerpt(text: &str, marker: &str) -> String {
    let marker = marker.to_lowercase();
    text.lines()
        .map(|line| ANSI_ESCAPE.replace_all(line, "").trim().to_string())
        .find(|line| line.to_lowercase().contains(&marker))
        .unwrap_or_else(|| marker.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_the_marker_url() {
        let output = "AUTH_URL_FOUND: https://claude.ai/oauth/authorize?code=true&state=abc\r\nWAITING_FOR_CODE\r\n";
        assert_eq!(
            find_auth_url(output).as_deref(),
            Some("https://claude.ai/oauth/authorize?code=true&state=abc")
        );
    }

    #[test]
    fn unterminated_url_is_not_reported() {
        assert_eq!(find_auth_url("AUTH_URL_FOUND: https://claude.ai/oauth/autho"), None);
    }

    #[test]
    fn falls_back_to_bare_url_ended_by_control_byte() {
        let output = "Use the url below to sign in:\x1b[1m https://console.anthropic.com/oauth?x=1\x1b[0m\x07";
        assert_eq!(
            find_auth_url(output).as_deref(),
            Some("https://console.anthropic.com/oauth?x=1")
        );
    }

    #[test]
    fn window_detects_split_markers() {
        let mut window = MarkerWindow::default();
        window.push("AUTH_URL_FOUND: https://claude.ai/oa");
        assert_eq!(window.setup_signal(), None);
        window.push("uth?s=1\r\n");
        assert_eq!(
            window.setup_signal(),
            Some(SetupSignal::Url("https://claude.ai/oauth?s=1".into()))
        );
    }

    #[test]
    fn acknowledgement_and_success() {
        let mut window = MarkerWindow::default();
        window.push("CODE_REC");
        assert!(!window.acknowledged());
        window.push("EIVED\r\nCODE_SUBMITTED\r\n");
        assert!(window.acknowledged());
        assert_eq!(window.verify_signal(), None);
        window.push("Login successful\r\nAUTHENTICATION_SUCCESS\r\n");
        assert_eq!(window.verify_signal(), Some(VerifySignal::Success));
    }

    #[test]
    fn earliest_error_marker_wins() {
        let verdict = classify_verdict("CODE_ERROR code rejected\nAUTHENTICATION_SUCCESS\n");
        assert_eq!(
            verdict,
            Some(VerifySignal::Failure("CODE_ERROR code rejected".into()))
        );
        assert_eq!(
            classify_verdict("OAuth error: Invalid code"),
            Some(VerifySignal::Failure("OAuth error: Invalid code".into()))
        );
    }

    #[test]
    fn renders_script_with_settings() {
        let script = render_script("claude", "/tmp/comm/");
        assert!(script.contains("set comm_dir \"/tmp/comm\""));
        assert!(script.contains("spawn claude"));
        assert!(!script.contains('@'));
    }
}
