use sharp_sessions::{session_status, SessionTree, StatusContext};

/// One line per root followed by its indented children.
pub fn render_tree(tree: &SessionTree, ctx: &StatusContext<'_>) -> Vec<String> {
    let mut lines = Vec::with_capacity(tree.len() + tree.child_count());
    for node in &tree.roots {
        let suffix = match node.children.len() {
            0 => String::new(),
            1 => " (1 subagent)".to_string(),
            n => format!(" ({n} subagents)"),
        };
        if node.virtual_parent {
            lines.push(format!("{}{suffix}", node.session.title()));
        } else {
            let status = session_status(&node.session, ctx);
            lines.push(format!(
                "{} {} [{}]{suffix}",
                status.display().emoji,
                node.session.title(),
                status
            ));
        }
        for child in &node.children {
            let status = session_status(child, ctx);
            lines.push(format!(
                "  └ {} {} [{}]",
                status.display().emoji,
                child.title(),
                status
            ));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharp_core::{ActiveRun, ActiveRunSet, Session};
    use sharp_sessions::{ParentAssignments, ReadMarkers, RegexWaitingPredicate, SessionReconciler};

    const T0: i64 = 1_760_000_000_000;

    fn render(sessions: &[Session], runs: &ActiveRunSet, now_ms: i64) -> Vec<String> {
        let mut assignments = ParentAssignments::new();
        let tree = SessionReconciler::default().reconcile(sessions, runs, &mut assignments, None);
        let markers = ReadMarkers::new();
        let waiting = RegexWaitingPredicate::default();
        let ctx = StatusContext {
            active_runs: runs,
            read_markers: &markers,
            now_ms,
            waiting: &waiting,
        };
        render_tree(&tree, &ctx)
    }

    #[test]
    fn renders_roots_with_indented_children() {
        let mut parent = Session::new("agent:main:telegram:1", T0);
        parent.label = Some("Ops chat".to_string());
        parent.last_message_at = Some(T0);
        let mut child = Session::new("agent:main:subagent:a", T0 + 5_000);
        child.created_at = Some(T0 + 5_000);
        let mut old = Session::new("agent:main:subagent:b", T0 - 10_000_000);
        old.created_at = Some(T0 - 10_000_000);

        let runs = ActiveRunSet::from_runs([ActiveRun {
            session_key: child.key.clone(),
            run_id: "run-1".to_string(),
        }]);
        let lines = render(&[old, parent, child], &runs, T0 + 10_000);

        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Ops chat [recent] (2 subagents)"), "{}", lines[0]);
        assert!(lines[1].starts_with("  └ "));
        assert!(lines[1].ends_with("[running]"), "{}", lines[1]);
        assert!(lines[2].ends_with("main/subagent [idle]"), "{}", lines[2]);
    }

    #[test]
    fn orphans_render_under_unassigned() {
        let mut orphan = Session::new("agent:main:subagent:x", T0);
        orphan.created_at = Some(T0);
        let lines = render(&[orphan], &ActiveRunSet::default(), T0 + 1_000);
        assert_eq!(
            lines,
            vec![
                "Unassigned (1 subagent)".to_string(),
                "  └ 🔵 main/subagent [recent]".to_string(),
            ]
        );
    }
}
