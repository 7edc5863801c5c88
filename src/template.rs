// This file is part of StreamVault, a live-stream recording supervisor.

//! Filename template rendering (spec.md §6: "Filename template variables").

use base::{bail_t, Error};
use chrono::{DateTime, Datelike, Timelike, Utc};
use uuid::Uuid;

/// The substitution values available to a template at `start_recording` time.
pub struct TemplateContext<'a> {
    pub streamer: &'a str,
    pub title: &'a str,
    pub game: &'a str,
    pub twitch_id: &'a str,
    pub started_at: DateTime<Utc>,
    pub recording_id: Uuid,
    pub episode: i64,
    /// A short random/opaque token distinguishing recordings that would
    /// otherwise render identically (e.g. two streams starting the same
    /// second).
    pub unique: &'a str,
}

/// Renders `template`, replacing each `{variable}` placeholder. Unknown
/// variable names are a `TemplateError` (spec.md §7), resolved eagerly so a
/// bad template is caught at `start_recording` rather than after capture.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find('{') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(open) => {
                out.push_str(&rest[..open]);
                let after_open = &rest[open + 1..];
                let close = after_open.find('}').ok_or_else(|| {
                    base::format_err_t!(TemplateError, "unterminated '{{' in template {:?}", template)
                })?;
                let var = &after_open[..close];
                out.push_str(&substitute(var, ctx)?);
                rest = &after_open[close + 1..];
            }
        }
    }
    Ok(out)
}

fn substitute(var: &str, ctx: &TemplateContext) -> Result<String, Error> {
    let t = ctx.started_at;
    Ok(match var {
        "streamer" => ctx.streamer.to_string(),
        "title" => ctx.title.to_string(),
        "game" => ctx.game.to_string(),
        "twitch_id" => ctx.twitch_id.to_string(),
        "year" => format!("{:04}", t.year()),
        "month" => format!("{:02}", t.month()),
        "day" => format!("{:02}", t.day()),
        "hour" => format!("{:02}", t.hour()),
        "minute" => format!("{:02}", t.minute()),
        "second" => format!("{:02}", t.second()),
        "timestamp" => t.timestamp().to_string(),
        "datetime" => t.format("%Y%m%d_%H%M%S").to_string(),
        "id" => ctx.recording_id.to_string(),
        "season" => format!("S{:04}-{:02}", t.year(), t.month()),
        "episode" => format!("{:02}", ctx.episode),
        "unique" => ctx.unique.to_string(),
        other => bail_t!(TemplateError, "unknown template variable {{{}}}", other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext<'static> {
        TemplateContext {
            streamer: "someone",
            title: "Hello World",
            game: "Just Chatting",
            twitch_id: "12345",
            started_at: DateTime::parse_from_rfc3339("2026-03-05T09:07:03Z")
                .unwrap()
                .with_timezone(&Utc),
            recording_id: Uuid::nil(),
            episode: 4,
            unique: "ab12",
        }
    }

    #[test]
    fn renders_known_variables() {
        let rendered = render("{streamer}_{year}-{month}-{day}_{episode}", &ctx()).unwrap();
        assert_eq!(rendered, "someone_2026-03-05_04");
    }

    #[test]
    fn season_and_datetime() {
        let rendered = render("{season}/{datetime}", &ctx()).unwrap();
        assert_eq!(rendered, "S2026-03/20260305_090703");
    }

    #[test]
    fn unknown_variable_is_template_error() {
        let err = render("{bogus}", &ctx()).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::TemplateError);
    }

    #[test]
    fn unterminated_brace_is_template_error() {
        let err = render("{streamer", &ctx()).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::TemplateError);
    }

    #[test]
    fn literal_text_passes_through() {
        assert_eq!(render("plain/path.ts", &ctx()).unwrap(), "plain/path.ts");
    }
}
