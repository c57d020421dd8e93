use fuzzy_matcher::{skim::SkimMatcherV2, FuzzyMatcher};
use log::{debug, trace};
use serde::Serialize;

use crate::{EntityKind, Snapshot};

/// One ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub kind: EntityKind,
    pub id: String,
    pub title: String,
    pub score: i64,
}

fn score(matcher: &SkimMatcherV2, title: &str, content: &str, query: &str) -> i64 {
    // title matches are weighted more heavily
    let title_score = matcher.fuzzy_match(title, query).unwrap_or(0);
    let content_score = matcher.fuzzy_match(content, query).unwrap_or(0);
    title_score * 2 + content_score
}

/// Fuzzy search across tasks, ideas and calendar events, best match first.
pub fn search(snapshot: &Snapshot, query: &str, limit: usize) -> Vec<SearchHit> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }
    let matcher = SkimMatcherV2::default();
    let mut hits = Vec::new();

    let mut consider = |kind: EntityKind, id: &str, title: &str, content: &str| {
        let score = score(&matcher, title, content, query);
        if score > 0 {
            trace!("{} {} matched with score {}", kind, id, score);
            hits.push(SearchHit {
                kind,
                id: id.to_string(),
                title: title.to_string(),
                score,
            });
        }
    };

    for task in snapshot.tasks.iter() {
        let mut content = task.description.clone().unwrap_or_default();
        for subtask in &task.subtasks {
            content.push('\n');
            content.push_str(&subtask.title);
        }
        consider(EntityKind::Task, &task.id, &task.title, &content);
    }
    for idea in snapshot.ideas.iter() {
        let content = format!("{}\n{}", idea.body(), idea.tags.join(" "));
        consider(EntityKind::Idea, &idea.id, &idea.title, &content);
    }
    for event in snapshot.calendar_events.iter() {
        let content = event.description.as_deref().unwrap_or_default();
        consider(EntityKind::CalendarEvent, &event.id, &event.title, content);
    }

    hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.title.cmp(&b.title)));
    hits.truncate(limit);
    debug!("Search for '{}' returned {} hits", query, hits.len());
    hits
}
