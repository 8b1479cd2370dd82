//! crates/tutor_core/src/prompt.rs
//!
//! System prompt for the tutoring model.

use crate::domain::{LanguagePreference, Lesson, User};
use crate::ports::SearchResult;

const ROLE_FRAMING: &str =
    "You are an AI tutor who helps learners understand the material of their current lesson.";

const TOPIC_PRIORITY: &str = r#"TOPIC PRIORITY:
- Always answer about the literal topic of the learner's question.
- The profile below describes how to explain, not what to explain. If the question is about topic X and the learner's stated goals or specialization point to topic Y, answer about X.
- Use the relevant context when it helps; say so when it does not cover the question."#;

const TOOL_GUIDANCE: &str = r#"TOOLS AVAILABLE:
- searchResources: finds additional course resources, learning materials and references related to the learner's question. It searches embedded course content and external resources.

When to use searchResources:
- The learner asks for examples or additional explanations
- The learner needs supplementary learning materials
- The learner asks about a specific topic that would benefit from external resources
- You need more detailed information about a concept"#;

fn language_directive(language: Option<LanguagePreference>) -> &'static str {
    match language.unwrap_or(LanguagePreference::Indonesian) {
        LanguagePreference::Indonesian => {
            "LANGUAGE: Answer only in Bahasa Indonesia."
        }
        LanguagePreference::English => "LANGUAGE: Answer only in English.",
        LanguagePreference::Mixed => {
            "LANGUAGE: Answer in Bahasa Indonesia, but keep technical terms in English."
        }
    }
}

/// Joins the non-empty snippets, best match first.
pub fn context_section(results: &[SearchResult]) -> String {
    results
        .iter()
        .filter_map(|r| r.content.as_deref())
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_system_prompt(user: &User, lesson: &Lesson, results: &[SearchResult]) -> String {
    let style = user
        .explanation_style
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("clear and friendly");
    let goals = if user.learning_goals.is_empty() {
        "not stated".to_string()
    } else {
        user.learning_goals.join(", ")
    };
    let language = user
        .language
        .unwrap_or(LanguagePreference::Indonesian)
        .as_str();

    format!(
        "{ROLE_FRAMING}\n\n\
         {TOPIC_PRIORITY}\n\n\
         User Profile:\n\
         - Difficulty Level: {level}\n\
         - Explanation Style: {style}\n\
         - Learning Goals: {goals}\n\
         - Language Preference: {language}\n\n\
         Current Lesson: {title}\n\n\
         Relevant Context:\n\
         {context}\n\n\
         {TOOL_GUIDANCE}\n\n\
         Explain in a {style} style suited to a {level} learner.\n\
         {directive}",
        level = user.level,
        title = lesson.title,
        context = context_section(results),
        directive = language_directive(user.language),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hit, lesson, user};

    #[test]
    fn prompt_carries_profile_lesson_and_context() {
        let mut learner = user("u1");
        learner.explanation_style = Some("visual".into());
        learner.learning_goals = vec!["backend".into(), "rust".into()];
        let results = vec![hit("a", 0.9, "Closures capture variables."), hit("b", 0.5, "Fn traits.")];

        let prompt = build_system_prompt(&learner, &lesson("l1", "Closures in Rust"), &results);

        assert!(prompt.contains("Current Lesson: Closures in Rust"));
        assert!(prompt.contains("- Difficulty Level: beginner"));
        assert!(prompt.contains("- Explanation Style: visual"));
        assert!(prompt.contains("- Learning Goals: backend, rust"));
        assert!(prompt.contains("Relevant Context:\nClosures capture variables.\nFn traits.\n"));
        assert!(prompt.contains("searchResources"));
    }

    #[test]
    fn empty_results_leave_a_well_formed_empty_context() {
        let prompt = build_system_prompt(&user("u1"), &lesson("l1", "Closures"), &[]);
        assert!(prompt.contains("Relevant Context:\n\n\nTOOLS AVAILABLE:"));
    }

    #[test]
    fn empty_snippets_are_skipped() {
        let mut blank = hit("b", 0.8, "   ");
        let missing = {
            let mut h = hit("c", 0.7, "");
            h.content = None;
            h
        };
        blank.content = Some("  ".into());
        assert_eq!(
            context_section(&[hit("a", 0.9, "kept"), blank, missing]),
            "kept"
        );
    }

    #[test]
    fn language_defaults_to_indonesian() {
        let prompt = build_system_prompt(&user("u1"), &lesson("l1", "T"), &[]);
        assert!(prompt.contains("- Language Preference: id"));
        assert!(prompt.ends_with("Answer only in Bahasa Indonesia."));
    }

    #[test]
    fn language_directive_follows_preference() {
        let mut learner = user("u1");
        learner.language = Some(LanguagePreference::English);
        assert!(build_system_prompt(&learner, &lesson("l1", "T"), &[])
            .ends_with("Answer only in English."));

        learner.language = Some(LanguagePreference::Mixed);
        assert!(build_system_prompt(&learner, &lesson("l1", "T"), &[])
            .ends_with("keep technical terms in English."));
    }

    #[test]
    fn literal_topic_outranks_profile() {
        let prompt = build_system_prompt(&user("u1"), &lesson("l1", "T"), &[]);
        assert!(prompt.contains("answer about X"));
    }
}
