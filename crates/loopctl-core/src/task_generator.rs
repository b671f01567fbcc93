//! Produces the per-iteration prompt file containing only the current
//! story, so the AI subprocess cannot see (and is instructed not to
//! touch) the rest of the backlog.

use std::path::{Path, PathBuf};

use loopctl_types::Story;

use crate::atomic_io::write_atomic_str;

pub const STABLE_TASK_FILENAME: &str = "CURRENT_TASK.md";

/// Renders one story into the markdown prompt body. Exposed separately
/// from `write_task_file` so callers can preview or log the text.
pub fn render_task_prompt(
    project_description: &str,
    story: &Story,
    spec_excerpt: Option<&str>,
    previous_error: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str("# Project\n\n");
    out.push_str(project_description.trim());
    out.push_str("\n\n# Current story: ");
    out.push_str(&story.id.to_string());
    out.push_str(" — ");
    out.push_str(&story.title);
    out.push_str("\n\n");

    if !story.description.trim().is_empty() {
        out.push_str(story.description.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Acceptance criteria\n\n");
    for criterion in &story.acceptance_criteria {
        out.push_str("- [ ] ");
        out.push_str(criterion);
        out.push('\n');
    }
    out.push('\n');

    if !story.notes.trim().is_empty() {
        out.push_str("## Notes\n\n");
        out.push_str(story.notes.trim());
        out.push_str("\n\n");
    }

    if let Some(excerpt) = spec_excerpt {
        out.push_str("## Specification excerpt\n\n");
        out.push_str(excerpt.trim());
        out.push_str("\n\n");
    }

    out.push_str(
        "## Constraints\n\nWork only on the story above. Do not modify any other story, \
         and do not edit the backlog file directly — completion is reported through the \
         agreed signal, not by editing data files.\n",
    );

    if let Some(error) = previous_error {
        out.push_str("\n## Previous attempt failed\n\n");
        out.push_str(error.trim());
        out.push('\n');
    }

    out
}

/// Pull the section of a long-form markdown specification whose heading
/// text contains `story_title` (case-insensitive), up to the next
/// heading of the same or shallower level. Returns `None` if no heading
/// matches; this is a best-effort convenience, not a markdown parser.
pub fn extract_story_section<'a>(spec_text: &'a str, story_title: &str) -> Option<&'a str> {
    let needle = story_title.to_lowercase();
    let lines: Vec<&str> = spec_text.lines().collect();

    let start = lines.iter().position(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with('#') && trimmed.to_lowercase().contains(&needle)
    })?;
    let start_level = lines[start].chars().take_while(|c| *c == '#').count();

    let mut end = lines.len();
    for (offset, line) in lines.iter().enumerate().skip(start + 1) {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            if level <= start_level {
                end = offset;
                break;
            }
        }
    }

    let start_byte = lines[..start].iter().map(|l| l.len() + 1).sum::<usize>();
    let end_byte = lines[..end].iter().map(|l| l.len() + 1).sum::<usize>();
    Some(spec_text[start_byte..end_byte.min(spec_text.len())].trim_end())
}

/// Write the rendered prompt first into `state_dir` (the external,
/// per-feature state directory) then copy it into the working tree at
/// the stable path the AI is expected to read.
pub async fn write_task_file(
    state_dir: &Path,
    working_tree_root: &Path,
    project_description: &str,
    story: &Story,
    spec_excerpt: Option<&str>,
    previous_error: Option<&str>,
) -> anyhow::Result<PathBuf> {
    let rendered = render_task_prompt(project_description, story, spec_excerpt, previous_error);

    let state_path = state_dir.join(STABLE_TASK_FILENAME);
    write_atomic_str(&state_path, &rendered).await?;

    let working_path = working_tree_root.join(STABLE_TASK_FILENAME);
    write_atomic_str(&working_path, &rendered).await?;

    Ok(working_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopctl_types::StoryId;
    use tempfile::tempdir;

    fn sample_story() -> Story {
        Story {
            id: StoryId::new(1),
            title: "Add login form".into(),
            description: "Implement a login form.".into(),
            acceptance_criteria: vec!["Form renders".into(), "Submits to /login".into()],
            priority: 0,
            passes: false,
            notes: String::new(),
            model: None,
            mcp_servers: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn render_includes_only_the_current_story() {
        let story = sample_story();
        let rendered = render_task_prompt("demo project", &story, None, None);
        assert!(rendered.contains("STORY-001"));
        assert!(rendered.contains("Add login form"));
        assert!(rendered.contains("- [ ] Form renders"));
        assert!(!rendered.contains("STORY-002"));
    }

    #[test]
    fn render_appends_previous_failure_block() {
        let story = sample_story();
        let rendered = render_task_prompt("demo", &story, None, Some("tests failed: x"));
        assert!(rendered.contains("Previous attempt failed"));
        assert!(rendered.contains("tests failed: x"));
    }

    #[test]
    fn extract_story_section_finds_matching_heading() {
        let spec = "# Intro\n\nignore\n\n## Add login form\n\nDo the thing.\n\n## Other story\n\nignore\n";
        let section = extract_story_section(spec, "Add login form").unwrap();
        assert!(section.contains("Do the thing."));
        assert!(!section.contains("Other story"));
    }

    #[test]
    fn extract_story_section_returns_none_when_no_heading_matches() {
        let spec = "# Intro\n\nno headings match here\n";
        assert!(extract_story_section(spec, "Add login form").is_none());
    }

    #[tokio::test]
    async fn write_task_file_copies_into_both_locations() {
        let state_dir = tempdir().unwrap();
        let working_dir = tempdir().unwrap();
        let story = sample_story();
        let path = write_task_file(
            state_dir.path(),
            working_dir.path(),
            "demo",
            &story,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(path, working_dir.path().join(STABLE_TASK_FILENAME));
        let state_contents = tokio::fs::read_to_string(state_dir.path().join(STABLE_TASK_FILENAME))
            .await
            .unwrap();
        let working_contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(state_contents, working_contents);
    }
}
