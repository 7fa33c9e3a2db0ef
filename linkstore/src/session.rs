use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller context threaded through validation, hooks and projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub user: Option<Value>,
    /// Raw `Accept-Language` value; `all` keeps every translation on view.
    #[serde(default)]
    pub accept_lang: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Session {
    pub fn with_user(user: Value) -> Self {
        Session {
            user: Some(user),
            ..Default::default()
        }
    }

    pub fn with_lang(mut self, accept_lang: impl Into<String>) -> Self {
        self.accept_lang = Some(accept_lang.into());
        self
    }

    /// Language chosen among `languages`, falling back to `default_lang`.
    pub fn lang(&self, languages: &[String], default_lang: &str) -> Lang {
        negotiate(self.accept_lang.as_deref(), languages, default_lang)
    }
}

/// Negotiated output language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lang {
    All,
    One(String),
}

impl Lang {
    /// Language used when wrapping plain text on write.
    pub fn write_lang<'a>(&'a self, default_lang: &'a str) -> &'a str {
        match self {
            Lang::All => default_lang,
            Lang::One(lang) => lang,
        }
    }
}

/// Pick the best language from an `Accept-Language` header by q-value.
pub fn negotiate(accept: Option<&str>, languages: &[String], default_lang: &str) -> Lang {
    let Some(accept) = accept else {
        return Lang::One(default_lang.to_string());
    };
    if accept.trim().eq_ignore_ascii_case("all") {
        return Lang::All;
    }

    let mut ranked: Vec<(f32, usize, String)> = accept
        .split(',')
        .enumerate()
        .filter_map(|(position, part)| {
            let mut pieces = part.split(';');
            let tag = pieces.next()?.trim().to_lowercase();
            if tag.is_empty() {
                return None;
            }
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((q, position, tag))
        })
        .collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

    for (_, _, tag) in ranked {
        if tag == "all" {
            return Lang::All;
        }
        let primary = tag.split('-').next().unwrap_or(&tag);
        if let Some(found) = languages
            .iter()
            .find(|l| l.eq_ignore_ascii_case(&tag) || l.eq_ignore_ascii_case(primary))
        {
            return Lang::One(found.clone());
        }
    }
    Lang::One(default_lang.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs() -> Vec<String> {
        vec!["en".into(), "ru".into()]
    }

    #[test]
    fn test_negotiate_by_quality() {
        assert_eq!(negotiate(Some("de;q=0.9, ru-RU;q=0.8, en;q=0.5"), &langs(), "en"), Lang::One("ru".into()));
        assert_eq!(negotiate(Some("en-US"), &langs(), "ru"), Lang::One("en".into()));
    }

    #[test]
    fn test_negotiate_fallbacks() {
        assert_eq!(negotiate(None, &langs(), "en"), Lang::One("en".into()));
        assert_eq!(negotiate(Some("fr"), &langs(), "en"), Lang::One("en".into()));
        assert_eq!(negotiate(Some("all"), &langs(), "en"), Lang::All);
        assert_eq!(Lang::All.write_lang("en"), "en");
    }

    #[test]
    fn test_session_lang() {
        let session = Session::default().with_lang("ru");
        assert_eq!(session.lang(&langs(), "en"), Lang::One("ru".into()));
    }
}
