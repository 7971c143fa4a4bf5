use crate::helm::client::{Install, Uninstall, Upgrade};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Domain of the recognized action-customization annotations.
pub const ANNOTATION_DOMAIN: &str = "helm.sdk.operatorframework.io";

/// Binds one annotation name to a mutation of an action struct. Only
/// annotations present on the CR yield options.
pub struct AnnotationHandler<A> {
    pub name: String,
    apply: Arc<dyn Fn(&mut A, &str) + Send + Sync>,
}

impl<A> Clone for AnnotationHandler<A> {
    fn clone(&self) -> Self {
        AnnotationHandler {
            name: self.name.clone(),
            apply: self.apply.clone(),
        }
    }
}

impl<A: 'static> AnnotationHandler<A> {
    pub fn new(
        name: impl Into<String>,
        apply: impl Fn(&mut A, &str) + Send + Sync + 'static,
    ) -> Self {
        AnnotationHandler {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    /// Options for the handlers whose annotation is present on the CR,
    /// each bound to the annotation's value.
    pub fn bind(
        handlers: &[AnnotationHandler<A>],
        annotations: &BTreeMap<String, String>,
    ) -> Vec<Box<dyn Fn(&mut A) + Send + Sync>> {
        handlers
            .iter()
            .filter_map(|handler| {
                let value = annotations.get(&handler.name)?.clone();
                let apply = handler.apply.clone();
                Some(Box::new(move |action: &mut A| apply(action, &value))
                    as Box<dyn Fn(&mut A) + Send + Sync>)
            })
            .collect()
    }
}

/// Boolean annotation values: "true"/"false", anything unparseable is
/// false.
fn parse_bool(value: &str) -> bool {
    value.parse().unwrap_or(false)
}

fn qualified(name: Option<String>, default: &str) -> String {
    name.unwrap_or_else(|| format!("{ANNOTATION_DOMAIN}/{default}"))
}

pub fn install_disable_hooks(name: Option<String>) -> AnnotationHandler<Install> {
    AnnotationHandler::<Install>::new(qualified(name, "install-disable-hooks"), |action, value| {
        action.disable_hooks = parse_bool(value)
    })
}

pub fn install_description(name: Option<String>) -> AnnotationHandler<Install> {
    AnnotationHandler::<Install>::new(qualified(name, "install-description"), |action, value| {
        action.description = Some(value.to_string())
    })
}

pub fn upgrade_disable_hooks(name: Option<String>) -> AnnotationHandler<Upgrade> {
    AnnotationHandler::<Upgrade>::new(qualified(name, "upgrade-disable-hooks"), |action, value| {
        action.disable_hooks = parse_bool(value)
    })
}

pub fn upgrade_force(name: Option<String>) -> AnnotationHandler<Upgrade> {
    AnnotationHandler::<Upgrade>::new(qualified(name, "upgrade-force"), |action, value| {
        action.force = parse_bool(value)
    })
}

pub fn upgrade_description(name: Option<String>) -> AnnotationHandler<Upgrade> {
    AnnotationHandler::<Upgrade>::new(qualified(name, "upgrade-description"), |action, value| {
        action.description = Some(value.to_string())
    })
}

pub fn uninstall_disable_hooks(name: Option<String>) -> AnnotationHandler<Uninstall> {
    AnnotationHandler::<Uninstall>::new(qualified(name, "uninstall-disable-hooks"), |action, value| {
        action.disable_hooks = parse_bool(value)
    })
}

pub fn uninstall_description(name: Option<String>) -> AnnotationHandler<Uninstall> {
    AnnotationHandler::<Uninstall>::new(qualified(name, "uninstall-description"), |action, value| {
        action.description = Some(value.to_string())
    })
}

pub fn default_install_handlers() -> Vec<AnnotationHandler<Install>> {
    vec![install_disable_hooks(None), install_description(None)]
}

pub fn default_upgrade_handlers() -> Vec<AnnotationHandler<Upgrade>> {
    vec![
        upgrade_disable_hooks(None),
        upgrade_force(None),
        upgrade_description(None),
    ]
}

pub fn default_uninstall_handlers() -> Vec<AnnotationHandler<Uninstall>> {
    vec![uninstall_disable_hooks(None), uninstall_description(None)]
}

#[cfg(test)]
mod test {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn apply_install(annotations: &BTreeMap<String, String>) -> Install {
        let mut action = Install::default();
        for opt in AnnotationHandler::bind(&default_install_handlers(), annotations) {
            opt(&mut action);
        }
        action
    }

    #[test]
    fn disable_hooks_parses_boolean_strings() {
        for (value, expected) in [
            ("true", true),
            ("false", false),
            ("True", false),
            ("yes", false),
            ("", false),
        ] {
            let action = apply_install(&annotations(&[(
                "helm.sdk.operatorframework.io/install-disable-hooks",
                value,
            )]));
            assert_eq!(action.disable_hooks, expected, "value {value:?}");
        }
    }

    #[test]
    fn absent_annotations_yield_no_options() {
        let opts = AnnotationHandler::bind(&default_upgrade_handlers(), &annotations(&[]));
        assert!(opts.is_empty());
    }

    #[test]
    fn force_and_description_compose() {
        let ann = annotations(&[
            ("helm.sdk.operatorframework.io/upgrade-force", "true"),
            ("helm.sdk.operatorframework.io/upgrade-description", "bumped"),
        ]);
        let mut action = Upgrade::default();
        for opt in AnnotationHandler::bind(&default_upgrade_handlers(), &ann) {
            opt(&mut action);
        }
        assert!(action.force);
        assert_eq!(action.description.as_deref(), Some("bumped"));
        assert!(!action.disable_hooks);
    }

    #[test]
    fn annotation_names_are_customizable() {
        let handler = uninstall_disable_hooks(Some("example.com/no-hooks".to_string()));
        let ann = annotations(&[("example.com/no-hooks", "true")]);
        let mut action = Uninstall::default();
        for opt in AnnotationHandler::bind(&[handler], &ann) {
            opt(&mut action);
        }
        assert!(action.disable_hooks);
    }
}
