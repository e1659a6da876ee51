//! Structural validation of cascade documents.
//!
//! Runs at load time, before any cell executes. Catches the configuration
//! errors of spec class one: duplicate cell names, dangling handoff and
//! routing targets, and invalid decision routes.

use super::document::{Cascade, CascadeError};
use rustc_hash::FxHashSet;

/// Routing keywords that are not cell names.
const ROUTING_KEYWORDS: &[&str] = &["continue", "retry", "fail"];

pub(crate) fn validate_cascade(cascade: &Cascade) -> Result<(), CascadeError> {
    if cascade.cascade_id.is_empty() {
        return Err(invalid(cascade, "cascade_id must not be empty"));
    }
    if cascade.cells.is_empty() {
        return Err(invalid(cascade, "cascade must declare at least one cell"));
    }

    let mut names: FxHashSet<&str> = FxHashSet::default();
    for cell in &cascade.cells {
        if !names.insert(cell.name.as_str()) {
            return Err(invalid(
                cascade,
                &format!("duplicate cell name '{}'", cell.name),
            ));
        }
    }

    for cell in &cascade.cells {
        for target in &cell.handoffs {
            if !names.contains(target.as_str()) {
                return Err(invalid(
                    cascade,
                    &format!("cell '{}' hands off to unknown cell '{target}'", cell.name),
                ));
            }
        }
        if let Some(routing) = &cell.routing {
            for target in routing.values() {
                if !names.contains(target.as_str()) {
                    return Err(invalid(
                        cascade,
                        &format!("cell '{}' routes to unknown cell '{target}'", cell.name),
                    ));
                }
            }
        }
        if let Some(decisions) = &cell.decision_points {
            for target in decisions.routing.values() {
                let is_keyword = ROUTING_KEYWORDS.contains(&target.as_str());
                if !is_keyword && !names.contains(target.as_str()) {
                    return Err(invalid(
                        cascade,
                        &format!(
                            "cell '{}' decision route targets unknown cell '{target}'",
                            cell.name
                        ),
                    ));
                }
            }
        }
        if let Some(on_error) = &cell.on_error {
            if let super::document::OnErrorSpec::Route(target) = on_error {
                if target != "auto_fix" && !names.contains(target.as_str()) {
                    return Err(invalid(
                        cascade,
                        &format!(
                            "cell '{}' on_error targets unknown cell '{target}'",
                            cell.name
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}

fn invalid(cascade: &Cascade, reason: &str) -> CascadeError {
    CascadeError::Invalid {
        cascade_id: cascade.cascade_id.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::document::Cascade;

    #[test]
    fn dangling_handoff_is_rejected() {
        let doc = r#"
cascade_id: x
cells:
  - name: a
    tool: t
    handoffs: [nope]
"#;
        let err = Cascade::from_str(doc).unwrap_err();
        assert!(err.to_string().contains("unknown cell 'nope'"));
    }

    #[test]
    fn duplicate_cell_names_are_rejected() {
        let doc = r#"
cascade_id: x
cells:
  - name: a
    tool: t
  - name: a
    instructions: hi
"#;
        let err = Cascade::from_str(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate cell name"));
    }

    #[test]
    fn decision_keywords_are_allowed() {
        let doc = r#"
cascade_id: x
cells:
  - name: a
    instructions: hi
    decision_points:
      routing:
        "approve": continue
        "redo": retry
        "abort": fail
"#;
        assert!(Cascade::from_str(doc).is_ok());
    }

    #[test]
    fn on_error_auto_fix_keyword_is_allowed() {
        let doc = r#"
cascade_id: x
cells:
  - name: a
    tool: t
    on_error: auto_fix
"#;
        assert!(Cascade::from_str(doc).is_ok());
    }
}
