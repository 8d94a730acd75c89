/// Interest filter over candidate title/summary. Matching is
/// case-insensitive substring; an empty keyword set accepts everything.
#[derive(Debug, Clone)]
pub struct KeywordFilter {
    keywords: Vec<String>,
}

impl KeywordFilter {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    pub fn accept_all() -> Self {
        Self::new(Vec::new())
    }

    pub fn matches(&self, title: &str, summary: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let haystack = format!("{} {}", title, summary).to_lowercase();
        self.keywords.iter().any(|kw| haystack.contains(kw))
    }
}
