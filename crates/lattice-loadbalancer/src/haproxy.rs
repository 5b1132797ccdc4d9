//! haproxy.cfg rendering

use lattice_common::template::TemplateEngine;
use lattice_common::Result;

use crate::backend::BackendView;

/// Built-in haproxy.cfg template
///
/// Fields: `frontend_control_plane_port`, `backend_control_plane_port` and
/// `backend_servers` (name to `address`, `weight`).
pub const DEFAULT_HAPROXY_TEMPLATE: &str = r#"global
  log /dev/log local0
  log /dev/log local1 notice
  daemon
  # limit memory usage to approximately 18 MB
  maxconn 100000

defaults
  log global
  mode tcp
  option dontlognull
  timeout connect 5000
  timeout client 50000
  timeout server 50000
  # allow to boot despite dns don't resolve backends
  default-server init-addr none

frontend stats
  mode http
  bind *:8404
  stats enable
  stats uri /stats
  stats refresh 1s
  stats admin if TRUE

frontend control-plane
  bind *:{{ frontend_control_plane_port }}
  default_backend kube-apiservers

backend kube-apiservers
  option httpchk GET /healthz
  {% for name, server in backend_servers | items %}
  server {{ name }} {{ server.address | ip_literal }}:{{ backend_control_plane_port }} weight {{ server.weight }} check check-ssl verify none
  {% endfor %}
"#;

/// Render haproxy.cfg for `view`, using `custom_template` when set
pub fn render_haproxy_config(view: &BackendView, custom_template: Option<&str>) -> Result<String> {
    let template = custom_template
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_HAPROXY_TEMPLATE);
    Ok(TemplateEngine::new().render(template, view)?)
}

/// Check the syntax of an operator supplied template
pub fn validate_haproxy_template(template: &str) -> Result<()> {
    Ok(TemplateEngine::new().validate_syntax(template)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> BackendView {
        BackendView::default()
            .with_server("c1-cp-b", "fd42::2")
            .with_server("c1-cp-a", "10.0.0.1")
    }

    #[test]
    fn test_default_template_lists_servers_by_name() {
        let cfg = render_haproxy_config(&view(), None).expect("render");

        assert!(cfg.contains("  bind *:6443\n"));
        let a = cfg
            .find("  server c1-cp-a 10.0.0.1:6443 weight 100 check check-ssl verify none\n")
            .expect("server a");
        let b = cfg
            .find("  server c1-cp-b [fd42::2]:6443 weight 100 check check-ssl verify none\n")
            .expect("server b");
        assert!(a < b);
        assert!(!cfg.contains("{%"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let first = render_haproxy_config(&view(), None).expect("render");
        let second = render_haproxy_config(&view(), None).expect("render");
        assert_eq!(first, second);
    }

    #[test]
    fn test_custom_template_replaces_default() {
        let custom = "{% for name, server in backend_servers | items %}{{ name }}={{ server.address }}\n{% endfor %}";
        let cfg = render_haproxy_config(&view(), Some(custom)).expect("render");
        assert_eq!(cfg, "c1-cp-a=10.0.0.1\nc1-cp-b=fd42::2\n");

        let empty = render_haproxy_config(&view(), Some("")).expect("render");
        assert!(empty.starts_with("global\n"));
    }

    #[test]
    fn test_template_errors() {
        let err = render_haproxy_config(&view(), Some("{{ missing_field }}"))
            .expect_err("undefined field");
        assert!(!err.is_terminal());

        assert!(validate_haproxy_template("{% for %}").is_err());
        assert!(validate_haproxy_template(DEFAULT_HAPROXY_TEMPLATE).is_ok());
    }
}
