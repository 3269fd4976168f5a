use std::fs;
use std::time::Duration;

use keel::config::loader::load_stack;
use keel::config::parser::parse_stack;
use keel::config::types::{DeletionPolicy, PropertyValue, Reference, Segment};
use keel::error::EngineError;
use tempfile::TempDir;

const WEB_STACK: &str = r#"
stack: web
settings:
  parallelism: 4
  max_attempts: 3
  base_delay_ms: 50
variables:
  region: us-east-1
  instance_size: small
  public: false
tags:
  team: platform
  env: dev
resources:
  vpc:
    type: network
    properties:
      cidr: 10.0.0.0/16
      region: ${var.region}
  web:
    type: compute-instance
    depends_on: [vpc]
    properties:
      size: ${var.instance_size}
      subnet: ${ref.vpc.id}
      user_data: "REGION=${var.region} VPC=${ref.vpc.id}"
      tags:
        env: prod
schemas:
  network:
    immutable: [cidr]
outputs:
  vpc_arn:
    value: ${ref.vpc.arn}
    description: ARN of the VPC
  public_ip:
    value: ${ref.web.public_ip}
    condition: public
"#;

fn write_stack(content: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stack.yaml");
    fs::write(&path, content).unwrap();
    (dir, path)
}

fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|e| e.downcast_ref::<EngineError>())
}

#[test]
fn test_parse_valid_stack() {
    let file = parse_stack(WEB_STACK).unwrap();
    assert_eq!(file.stack.as_deref(), Some("web"));
    assert_eq!(file.resources.len(), 2);
    assert_eq!(file.resources["web"].depends_on, vec!["vpc"]);
    assert_eq!(file.schemas["network"].immutable, vec!["cidr"]);
    assert_eq!(file.outputs["public_ip"].condition.as_deref(), Some("public"));
}

#[test]
fn test_unknown_fields_rejected() {
    let yaml = r#"
resources:
  vpc:
    type: network
    propertes:
      cidr: 10.0.0.0/16
"#;
    assert!(parse_stack(yaml).is_err());
}

#[test]
fn test_load_substitutes_variables_and_settings() {
    let (_dir, path) = write_stack(WEB_STACK);
    let stack = load_stack(&path, &[]).unwrap();

    assert_eq!(stack.name, "web");
    assert_eq!(stack.settings.parallelism, 4);
    assert_eq!(stack.settings.max_attempts, 3);
    assert_eq!(stack.settings.base_delay, Duration::from_millis(50));
    assert_eq!(stack.settings.provider, "local");

    let vpc = stack.resources.iter().find(|r| r.id == "vpc").unwrap();
    assert_eq!(vpc.properties["region"], PropertyValue::String("us-east-1".into()));

    let web = stack.resources.iter().find(|r| r.id == "web").unwrap();
    assert_eq!(web.properties["size"], PropertyValue::String("small".into()));
    assert_eq!(
        web.properties["subnet"],
        PropertyValue::Reference(Reference::new("vpc", "id"))
    );
    assert_eq!(
        web.properties["user_data"],
        PropertyValue::Interpolated(vec![
            Segment::Literal("REGION=us-east-1 VPC=".into()),
            Segment::Reference(Reference::new("vpc", "id")),
        ])
    );
    assert_eq!(web.dependencies().into_iter().collect::<Vec<_>>(), vec!["vpc"]);
}

#[test]
fn test_command_line_overrides_win() {
    let (_dir, path) = write_stack(WEB_STACK);
    let overrides = vec![
        ("instance_size".to_string(), "large".to_string()),
        ("public".to_string(), "true".to_string()),
    ];
    let stack = load_stack(&path, &overrides).unwrap();

    let web = stack.resources.iter().find(|r| r.id == "web").unwrap();
    assert_eq!(web.properties["size"], PropertyValue::String("large".into()));
    assert!(stack.outputs.iter().all(|o| o.enabled));
}

#[test]
fn test_stack_tags_merge_under_resource_tags() {
    let (_dir, path) = write_stack(WEB_STACK);
    let stack = load_stack(&path, &[]).unwrap();

    let web = stack.resources.iter().find(|r| r.id == "web").unwrap();
    match &web.properties["tags"] {
        PropertyValue::Map(tags) => {
            assert_eq!(tags["team"], PropertyValue::String("platform".into()));
            // Resource-level tags win
            assert_eq!(tags["env"], PropertyValue::String("prod".into()));
        }
        other => panic!("expected a tag map, got {:?}", other),
    }
    let vpc = stack.resources.iter().find(|r| r.id == "vpc").unwrap();
    assert!(matches!(vpc.properties["tags"], PropertyValue::Map(ref t) if t.len() == 2));
}

#[test]
fn test_schemas_and_conditional_outputs() {
    let (_dir, path) = write_stack(WEB_STACK);
    let stack = load_stack(&path, &[]).unwrap();

    assert!(stack.schemas.get("network").is_immutable("cidr"));
    assert!(!stack.schemas.get("compute-instance").is_immutable("size"));

    let vpc_arn = stack.outputs.iter().find(|o| o.name == "vpc_arn").unwrap();
    assert!(vpc_arn.enabled);
    assert_eq!(vpc_arn.description.as_deref(), Some("ARN of the VPC"));
    let public_ip = stack.outputs.iter().find(|o| o.name == "public_ip").unwrap();
    assert!(!public_ip.enabled);
}

#[test]
fn test_undefined_variable_is_an_error() {
    let (_dir, path) = write_stack(
        r#"
resources:
  vpc:
    type: network
    properties:
      region: ${var.nowhere}
"#,
    );
    let err = load_stack(&path, &[]).unwrap_err();
    assert!(format!("{:#}", err).contains("Undefined variable 'var.nowhere'"));
}

#[test]
fn test_stack_name_defaults_to_file_stem() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("payments.yaml");
    fs::write(&path, "resources:\n  q:\n    type: queue\n").unwrap();
    let stack = load_stack(&path, &[]).unwrap();
    assert_eq!(stack.name, "payments");
}

#[test]
fn test_invalid_resource_id() {
    let (_dir, path) = write_stack(
        r#"
resources:
  "web server":
    type: compute-instance
"#,
    );
    let err = load_stack(&path, &[]).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::InvalidConfig(_))));
    assert_eq!(engine_error(&err).map(EngineError::exit_code), Some(2));
}

#[test]
fn test_escaped_reference_stays_literal() {
    let (_dir, path) = write_stack(
        r#"
resources:
  fn:
    type: function
    properties:
      template: "$${ref.not.a_reference}"
"#,
    );
    let stack = load_stack(&path, &[]).unwrap();
    let resource = &stack.resources[0];
    assert!(resource.dependencies().is_empty());
    assert_eq!(
        resource.properties["template"],
        PropertyValue::String("${ref.not.a_reference}".into())
    );
}

#[test]
fn test_directory_of_files_merges() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("01-network.yaml"),
        r#"
stack: shop
variables:
  region: eu-west-1
resources:
  vpc:
    type: network
    properties:
      region: ${var.region}
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("02-compute.yml"),
        r#"
variables:
  region: us-east-1
resources:
  web:
    type: compute-instance
    properties:
      subnet: ${ref.vpc.id}
outputs:
  web_id:
    value: ${ref.web.id}
"#,
    )
    .unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let stack = load_stack(dir.path(), &[]).unwrap();
    assert_eq!(stack.name, "shop");
    assert_eq!(stack.resources.len(), 2);
    assert_eq!(stack.outputs.len(), 1);
    // First file wins for variables
    let vpc = stack.resources.iter().find(|r| r.id == "vpc").unwrap();
    assert_eq!(vpc.properties["region"], PropertyValue::String("eu-west-1".into()));
}

#[test]
fn test_duplicate_resource_across_files() {
    let dir = TempDir::new().unwrap();
    for name in ["a.yaml", "b.yaml"] {
        fs::write(dir.path().join(name), "resources:\n  vpc:\n    type: network\n").unwrap();
    }
    let err = load_stack(dir.path(), &[]).unwrap_err();
    assert!(matches!(
        engine_error(&err),
        Some(EngineError::DuplicateResource(id)) if id == "vpc"
    ));
}

#[test]
fn test_missing_path_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = load_stack(&dir.path().join("nope.yaml"), &[]).unwrap_err();
    assert!(err.to_string().contains("Stack not found"));
}

const BASTION_STACK: &str = r#"
stack: ops
variables:
  allowed_ssh_ip: ""
resources:
  sg:
    type: security-group
    deletion_policy: retain
    properties:
      name: ops
  ssh_rule:
    type: security-group-rule
    condition: allowed_ssh_ip
    properties:
      group: ${ref.sg.id}
      cidr: ${var.allowed_ssh_ip}
      port: 22
outputs:
  ssh_rule_id:
    value: ${ref.ssh_rule.id}
    condition: allowed_ssh_ip
"#;

#[test]
fn test_resource_condition_leaves_resource_out() {
    let (_dir, path) = write_stack(BASTION_STACK);
    let stack = load_stack(&path, &[]).unwrap();
    let ids: Vec<&str> = stack.resources.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["sg"]);
    assert!(!stack.outputs[0].enabled);

    let overrides = vec![("allowed_ssh_ip".to_string(), "203.0.113.7/32".to_string())];
    let stack = load_stack(&path, &overrides).unwrap();
    let rule = stack.resources.iter().find(|r| r.id == "ssh_rule").unwrap();
    assert_eq!(rule.properties["cidr"], PropertyValue::String("203.0.113.7/32".into()));
    assert!(stack.outputs[0].enabled);
}

#[test]
fn test_resource_condition_on_undefined_variable() {
    let (_dir, path) = write_stack(
        r#"
resources:
  rule:
    type: security-group-rule
    condition: nowhere
"#,
    );
    let err = load_stack(&path, &[]).unwrap_err();
    assert!(format!("{:#}", err).contains("undefined variable 'nowhere'"));
}

#[test]
fn test_deletion_policy_defaults_to_delete() {
    let (_dir, path) = write_stack(BASTION_STACK);
    let stack = load_stack(&path, &[("allowed_ssh_ip".into(), "10.0.0.1/32".into())]).unwrap();
    let policy = |id: &str| {
        stack
            .resources
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.deletion_policy)
    };
    assert_eq!(policy("sg"), Some(DeletionPolicy::Retain));
    assert_eq!(policy("ssh_rule"), Some(DeletionPolicy::Delete));

    let bad = BASTION_STACK.replace("deletion_policy: retain", "deletion_policy: snapshot");
    assert!(parse_stack(&bad).is_err());
}

