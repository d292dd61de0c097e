//! Local sentiment scoring for news headlines using VADER, boosted with
//! finance-specific keywords that the general lexicon misses, and folded
//! into a 0-100 signal score that the decision engine thresholds against.

use crate::domain::news::{NewsEvent, ScoredSignal};
use crate::domain::ports::SentimentScorer;
use vader_sentiment::SentimentIntensityAnalyzer;

const BULLISH_KEYWORDS: &[(&str, f64)] = &[
    ("surge", 0.4),
    ("surges", 0.4),
    ("rally", 0.4),
    ("rallies", 0.4),
    ("soar", 0.5),
    ("soars", 0.5),
    ("skyrocket", 0.6),
    ("skyrockets", 0.6),
    ("bullish", 0.5),
    ("all-time high", 0.5),
    ("record high", 0.4),
    ("breakout", 0.3),
    ("beats estimates", 0.5),
    ("beats expectations", 0.5),
    ("raises guidance", 0.5),
    ("upgrade", 0.3),
    ("upgraded", 0.3),
    ("acquisition", 0.3),
    ("buyback", 0.3),
    ("partnership", 0.2),
    ("breakthrough", 0.4),
    ("fda approval", 0.5),
    ("contract win", 0.4),
    ("opportunity", 0.2),
];

const BEARISH_KEYWORDS: &[(&str, f64)] = &[
    ("crash", -0.5),
    ("crashes", -0.5),
    ("plunge", -0.5),
    ("plunges", -0.5),
    ("bearish", -0.5),
    ("collapse", -0.5),
    ("collapses", -0.5),
    ("misses estimates", -0.5),
    ("misses expectations", -0.5),
    ("cuts guidance", -0.5),
    ("downgrade", -0.4),
    ("downgraded", -0.4),
    ("lawsuit", -0.4),
    ("investigation", -0.4),
    ("sec", -0.2),
    ("recall", -0.4),
    ("bankruptcy", -0.6),
    ("fraud", -0.5),
    ("breach", -0.4),
    ("sell-off", -0.4),
    ("selloff", -0.4),
    ("panic", -0.4),
    ("fear", -0.3),
    ("devastating", -0.5),
];

/// Company names the feed spells out without a cashtag, mapped to their
/// listings. Matched whole-word and case-insensitive.
const KNOWN_SYMBOLS: &[(&str, &str)] = &[
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("tesla", "TSLA"),
    ("nvidia", "NVDA"),
    ("amazon", "AMZN"),
    ("alphabet", "GOOGL"),
    ("google", "GOOGL"),
    ("meta platforms", "META"),
    ("netflix", "NFLX"),
    ("intel", "INTC"),
    ("amd", "AMD"),
    ("qualcomm", "QCOM"),
    ("broadcom", "AVGO"),
    ("micron", "MU"),
    ("paypal", "PYPL"),
    ("adobe", "ADBE"),
    ("cisco", "CSCO"),
    ("starbucks", "SBUX"),
    ("costco", "COST"),
    ("comcast", "CMCSA"),
];

/// VADER-backed scorer. Thread safe, no interior state beyond the lexicon.
pub struct NewsScorer {
    analyzer: SentimentIntensityAnalyzer<'static>,
}

impl NewsScorer {
    pub fn new() -> Self {
        Self {
            analyzer: SentimentIntensityAnalyzer::new(),
        }
    }

    fn financial_boost(text: &str) -> f64 {
        let text_lower = text.to_lowercase();
        let mut boost = 0.0;

        for (keyword, score) in BULLISH_KEYWORDS {
            if text_lower.contains(keyword) {
                boost += score;
            }
        }
        for (keyword, score) in BEARISH_KEYWORDS {
            if text_lower.contains(keyword) {
                boost += score; // already negative
            }
        }

        boost
    }

    /// Sentiment of one text in [-1.0, 1.0]: VADER compound plus half the
    /// keyword boost, clamped.
    fn analyze(&self, text: &str) -> f64 {
        if text.trim().is_empty() {
            return 0.0;
        }

        let scores = self.analyzer.polarity_scores(text);
        let vader_score = scores["compound"];
        let combined = vader_score + (Self::financial_boost(text) * 0.5);
        combined.clamp(-1.0, 1.0)
    }

    /// Headline weighted 70%, body 30%. Headlines carry most of the signal.
    fn analyze_news(&self, title: &str, content: &str) -> f64 {
        (self.analyze(title) * 0.7) + (self.analyze(content) * 0.3)
    }
}

impl Default for NewsScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentScorer for NewsScorer {
    fn score(&self, event: &NewsEvent) -> ScoredSignal {
        let sentiment = self.analyze_news(&event.title, &event.content);
        let ticker = extract_cashtag(&event.title)
            .or_else(|| extract_cashtag(&event.content))
            .or_else(|| lookup_known_symbol(&event.title))
            .or_else(|| lookup_known_symbol(&event.content));
        let positive_pct = (sentiment + 1.0) / 2.0 * 100.0;

        ScoredSignal {
            event: event.clone(),
            ticker,
            sentiment,
            positive_pct,
            signal_score: signal_score(sentiment),
        }
    }
}

/// Fold a [-1, 1] sentiment into a 0-100 signal score.
///
/// Weighted blend of the upside probability, the inverse downside
/// probability, certainty (absolute sentiment) and the raw sentiment
/// rescaled to 0-100. Neutral text lands at 40.
pub fn signal_score(sentiment: f64) -> f64 {
    let bullish = (sentiment + 1.0) / 2.0 * 100.0;
    let bearish = 100.0 - bullish;
    let confidence = sentiment.abs();

    let score = bullish * 0.4
        + (100.0 - bearish) * 0.3
        + confidence * 100.0 * 0.2
        + (sentiment + 1.0) * 50.0 * 0.1;
    score.clamp(0.0, 100.0)
}

/// First `$TICKER` cashtag in the text: a `$` followed by one to five
/// uppercase letters ending at a word boundary. `$5,000` and `$FOOBARX`
/// do not match.
pub fn extract_cashtag(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_uppercase() && end - start < 5 {
                end += 1;
            }
            let at_boundary = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
            if end > start && at_boundary {
                return Some(text[start..end].to_string());
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }
    None
}

/// Ticker for a known company name appearing in the text as a whole word.
pub fn lookup_known_symbol(text: &str) -> Option<String> {
    let text_lower = text.to_lowercase();
    KNOWN_SYMBOLS
        .iter()
        .find(|(name, _)| contains_word(&text_lower, name))
        .map(|(_, ticker)| (*ticker).to_string())
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    let hay = haystack.as_bytes();
    for (at, _) in haystack.match_indices(needle) {
        let before_ok = at == 0 || !hay[at - 1].is_ascii_alphanumeric();
        let after = at + needle.len();
        let after_ok = after == hay.len() || !hay[after].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(title: &str, content: &str) -> NewsEvent {
        NewsEvent {
            id: "test".to_string(),
            source: "RSS".to_string(),
            title: title.to_string(),
            content: content.to_string(),
            url: None,
            published_at: Utc::now(),
        }
    }

    #[test]
    fn bullish_headlines_score_positive() {
        let scorer = NewsScorer::new();

        let headlines = [
            "Shares surge to record high after earnings beats estimates",
            "Stock rallies on breakthrough FDA approval",
            "Company soars after raising guidance and announcing buyback",
        ];

        for headline in headlines {
            let signal = scorer.score(&event(headline, ""));
            assert!(
                signal.sentiment > 0.0,
                "expected bullish sentiment for '{}', got {}",
                headline,
                signal.sentiment
            );
        }
    }

    #[test]
    fn bearish_headlines_score_negative() {
        let scorer = NewsScorer::new();

        let headlines = [
            "Stock crashes after devastating earnings collapse",
            "SEC opens fraud investigation into the company",
            "Shares plunge as firm misses estimates and cuts guidance",
        ];

        for headline in headlines {
            let signal = scorer.score(&event(headline, ""));
            assert!(
                signal.sentiment < 0.0,
                "expected bearish sentiment for '{}', got {}",
                headline,
                signal.sentiment
            );
        }
    }

    #[test]
    fn empty_text_is_neutral() {
        let scorer = NewsScorer::new();
        assert_eq!(scorer.analyze(""), 0.0);
        assert_eq!(scorer.analyze("   "), 0.0);
    }

    #[test]
    fn title_outweighs_content() {
        let scorer = NewsScorer::new();
        let strong_title = scorer.analyze_news(
            "Stock soars to record high on bullish breakout",
            "The shares traded within a range during the session.",
        );
        let strong_body = scorer.analyze_news(
            "The shares traded within a range during the session.",
            "Stock soars to record high on bullish breakout",
        );
        assert!(strong_title > strong_body);
    }

    #[test]
    fn keyword_boost_raises_generic_positive() {
        let scorer = NewsScorer::new();
        let generic = scorer.analyze("This is good news");
        let boosted = scorer.analyze("This is good news with a bullish surge");
        assert!(boosted > generic);
    }

    #[test]
    fn signal_score_anchors() {
        assert!((signal_score(0.0) - 40.0).abs() < 1e-9);
        assert!((signal_score(1.0) - 100.0).abs() < 1e-9);
        assert!((signal_score(-1.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn signal_score_grows_with_sentiment_above_neutral() {
        let mut last = signal_score(0.0);
        for step in 1..=10 {
            let s = step as f64 / 10.0;
            let score = signal_score(s);
            assert!(score > last, "score must rise with sentiment, s={s}");
            last = score;
        }
    }

    #[test]
    fn cashtag_extraction() {
        assert_eq!(extract_cashtag("Big move in $AAPL today"), Some("AAPL".to_string()));
        assert_eq!(extract_cashtag("$TSLA beats estimates"), Some("TSLA".to_string()));
        assert_eq!(extract_cashtag("ends with $NVDA"), Some("NVDA".to_string()));
        assert_eq!(extract_cashtag("$AMZN, up big"), Some("AMZN".to_string()));
        assert_eq!(extract_cashtag("raised $5,000 in funding"), None);
        assert_eq!(extract_cashtag("$toolong lowercase"), None);
        assert_eq!(extract_cashtag("$FOOBARX is six letters"), None);
        assert_eq!(extract_cashtag("no tag here"), None);
    }

    #[test]
    fn scored_signal_carries_ticker_from_title_first() {
        let scorer = NewsScorer::new();
        let signal = scorer.score(&event("$AAPL surges", "also mentions $MSFT"));
        assert_eq!(signal.ticker, Some("AAPL".to_string()));
    }

    #[test]
    fn known_symbol_lookup_is_whole_word() {
        assert_eq!(lookup_known_symbol("Apple unveils a new chip"), Some("AAPL".to_string()));
        assert_eq!(lookup_known_symbol("NVIDIA doubles data center revenue"), Some("NVDA".to_string()));
        assert_eq!(lookup_known_symbol("artificial intelligence startups raise funds"), None);
        assert_eq!(lookup_known_symbol("snapple recalls juice"), None);
        assert_eq!(lookup_known_symbol("no company here"), None);
    }

    #[test]
    fn cashtag_beats_company_name() {
        let scorer = NewsScorer::new();
        let signal = scorer.score(&event("Apple supplier $SWKS gains on strong orders", ""));
        assert_eq!(signal.ticker, Some("SWKS".to_string()));
    }

    #[test]
    fn company_name_fills_in_when_no_cashtag() {
        let scorer = NewsScorer::new();
        let signal = scorer.score(&event("Microsoft beats expectations", ""));
        assert_eq!(signal.ticker, Some("MSFT".to_string()));
    }
}
