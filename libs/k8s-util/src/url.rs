/// Replace the variable segments of a Kubernetes API path with
/// placeholders, so request metrics stay low-cardinality.
///
/// `/apis/apps/v1/namespaces/prod/deployments/web` becomes
/// `/apis/apps/v1/namespaces/{namespace}/deployments/{name}`; unknown
/// path shapes collapse to `/{prefix}`.
pub fn template_path(path: &str, base_path: Option<&str>) -> String {
    let (prefix, path) = match base_path {
        Some(base) if path.starts_with(base) => (base.trim_end_matches('/'), &path[base.len()..]),
        _ => ("", path),
    };
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() <= 2 {
        return format!("{prefix}{path}");
    }

    // /api/<version>/... for the core group, /apis/<group>/<version>/...
    // for named groups
    let resource_index = match segments[0] {
        "api" => 2,
        "apis" => 3,
        _ => return "/{prefix}".to_string(),
    };

    let is_subresource = |s: &str| s == "status" || s == "finalize";
    match segments.len().saturating_sub(resource_index) {
        0 | 1 => {}
        2 => {
            // /<resource>/<name>
            segments[resource_index + 1] = "{name}";
        }
        3 if is_subresource(segments[resource_index + 2]) => {
            // /<resource>/<name>/<subresource>
            segments[resource_index + 1] = "{name}";
        }
        3 => {
            // /namespaces/<namespace>/<resource>
            segments[resource_index + 1] = "{namespace}";
        }
        _ => {
            // /namespaces/<namespace>/<resource>/<name>[/<subresource>]
            segments[resource_index + 1] = "{namespace}";
            if !is_subresource(segments[resource_index + 3]) {
                segments[resource_index + 3] = "{name}";
            }
        }
    }

    format!("{prefix}/{}", segments.join("/"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn core_group_paths() {
        assert_eq!(
            template_path("/api/v1/pods/mypod", None),
            "/api/v1/pods/{name}"
        );
        assert_eq!(
            template_path("/api/v1/namespaces/prod/secrets", None),
            "/api/v1/namespaces/{namespace}/secrets"
        );
    }

    #[test]
    fn named_group_paths() {
        assert_eq!(
            template_path(
                "/apis/apps/v1/namespaces/prod/deployments/web",
                None
            ),
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}"
        );
        assert_eq!(
            template_path("/apis/apps/v1/deployments", None),
            "/apis/apps/v1/deployments"
        );
    }

    #[test]
    fn subresources_keep_their_suffix() {
        assert_eq!(
            template_path(
                "/apis/apps/v1/namespaces/prod/deployments/web/status",
                None
            ),
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}/status"
        );
        assert_eq!(
            template_path("/api/v1/namespaces/prod/finalize", None),
            "/api/v1/namespaces/{name}/finalize"
        );
    }

    #[test]
    fn base_paths_are_preserved() {
        assert_eq!(
            template_path("/base/api/v1/pods/mypod", Some("/base")),
            "/base/api/v1/pods/{name}"
        );
        assert_eq!(template_path("/base", Some("/base")), "/base");
    }

    #[test]
    fn unknown_shapes_collapse() {
        assert_eq!(template_path("/unknown/group/resource", None), "/{prefix}");
        assert_eq!(template_path("/", None), "/");
    }
}
