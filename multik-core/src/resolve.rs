//! Resolution of loose caller identifiers against a discovered resource table.
use crate::{operation::Operation, resource::ResourceDescriptor};

/// Find the descriptor a caller identifier addresses within one group version.
///
/// `arg` may be the exact resource name (`deployments`, `deployments/status`),
/// the kind (`Deployment`), a case-folded kind (`deployment`), a case-folded
/// plural (`Deployments`), or a short name (`deploy`). Rules are tried in
/// order and the first match wins; kind-based rules never match subresources
/// so that `Deployment` cannot pick `deployments/status`.
///
/// Descriptor names are unique within a group version, so each rule matches
/// at most once.
pub fn resolve<'a>(table: &'a [ResourceDescriptor], arg: &str) -> Option<&'a ResourceDescriptor> {
    let folded = arg.to_ascii_lowercase();
    table
        .iter()
        .find(|d| d.name == arg)
        .or_else(|| table.iter().find(|d| d.kind == arg && !d.is_subresource()))
        .or_else(|| {
            table
                .iter()
                .find(|d| d.kind.to_ascii_lowercase() == arg && !d.is_subresource())
        })
        .or_else(|| table.iter().find(|d| d.name == folded))
        .or_else(|| {
            table
                .iter()
                .find(|d| d.short_names.iter().any(|s| *s == folded) && !d.is_subresource())
        })
}

/// Resolve an operation's resource identifier, including its subresource.
///
/// When the operation carries a separate `subresource`, the base identifier
/// is resolved first and the lookup retried as `{plural}/{subresource}`.
pub fn resolve_operation<'a>(
    table: &'a [ResourceDescriptor],
    op: &Operation,
) -> Option<&'a ResourceDescriptor> {
    match &op.subresource {
        None => resolve(table, &op.resource),
        Some(sub) => {
            let base = resolve(table, &op.resource)?;
            resolve(table, &format!("{}/{}", base.base_name(), sub))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn table() -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor {
                kind: "Deployment".into(),
                name: "deployments".into(),
                namespaced: true,
                verbs: vec!["create".into(), "get".into(), "list".into(), "watch".into()],
                short_names: vec!["deploy".into()],
            },
            ResourceDescriptor {
                kind: "Deployment".into(),
                name: "deployments/status".into(),
                namespaced: true,
                verbs: vec!["get".into(), "patch".into(), "update".into()],
                short_names: vec![],
            },
        ]
    }

    #[test]
    fn resolves_plural_kind_and_folded_forms() {
        let t = table();
        for arg in ["deployments", "Deployment", "deployment", "Deployments"] {
            let d = resolve(&t, arg).unwrap_or_else(|| panic!("no match for {arg}"));
            assert_eq!(d.name, "deployments", "arg {arg}");
        }
    }

    #[test]
    fn kind_never_picks_a_subresource() {
        let t = table();
        assert_eq!(resolve(&t, "Deployment").unwrap().name, "deployments");
        assert_eq!(
            resolve(&t, "deployments/status").unwrap().name,
            "deployments/status"
        );
    }

    #[test]
    fn short_names_are_a_last_resort() {
        let t = table();
        assert_eq!(resolve(&t, "deploy").unwrap().name, "deployments");
        assert!(resolve(&t, "bogus").is_none());
    }

    #[test]
    fn operation_subresource_lookup() {
        let t = table();
        let op = Operation::get("apps/v1", "Deployment")
            .named("nginx")
            .subresource("status");
        assert_eq!(resolve_operation(&t, &op).unwrap().name, "deployments/status");

        let direct = Operation::get("apps/v1", "deployments/status").named("nginx");
        assert_eq!(
            resolve_operation(&t, &direct).unwrap().name,
            "deployments/status"
        );
    }
}
