use vcluster::error::EngineError;
use vcluster::manifest::parse_manifest;
use vcluster::resources::ResourceKind;

const STACK: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: shop
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: checkout
  namespace: shop
  labels:
    app: checkout
    tier: 2
spec:
  replicas: 4
  template:
    spec:
      containers:
        - name: checkout
          image: shop/checkout:1.4
---
---
apiVersion: v1
kind: Service
metadata:
  name: checkout
  namespace: shop
spec:
  ports:
    - port: 80
      targetPort: 8080
---
apiVersion: example.com/v1
kind: Widget
metadata:
  name: gizmo
spec:
  size: large
"#;

#[test]
fn test_documents_keep_order_and_skip_empty_ones() {
    let decls = parse_manifest(STACK).unwrap();
    let kinds: Vec<_> = decls.iter().map(|d| d.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Namespace,
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::Custom("Widget".to_string()),
        ]
    );
}

#[test]
fn test_metadata_is_extracted() {
    let decls = parse_manifest(STACK).unwrap();
    let checkout = &decls[1];
    assert_eq!(checkout.name, "checkout");
    assert_eq!(checkout.namespace, "shop");
    assert_eq!(checkout.labels["app"], "checkout");
    assert_eq!(checkout.labels["tier"], "2");
    assert_eq!(checkout.replicas(), 4);

    // No namespace falls back to default
    assert_eq!(decls[3].namespace, "default");
    assert_eq!(decls[3].spec["size"], "large");
}

#[test]
fn test_kind_matching_ignores_case() {
    let decls = parse_manifest("kind: deployment\nmetadata:\n  name: x\n").unwrap();
    assert_eq!(decls[0].kind, ResourceKind::Deployment);
    assert_eq!(decls[0].replicas(), 1);
}

#[test]
fn test_missing_name_is_malformed() {
    let manifest = "kind: Namespace\nmetadata:\n  name: ok\n---\nkind: Service\nmetadata: {}\n";
    let err = parse_manifest(manifest).unwrap_err();
    match err {
        EngineError::MalformedManifest(msg) => assert!(msg.contains("metadata.name"), "{msg}"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_empty_and_comment_only_input() {
    assert!(parse_manifest("").unwrap().is_empty());
    assert!(parse_manifest("# nothing here\n---\n").unwrap().is_empty());
}

#[test]
fn test_scalar_documents_are_ignored() {
    let manifest = "just a string\n---\nkind: Secret\nmetadata:\n  name: token\n";
    let decls = parse_manifest(manifest).unwrap();
    assert_eq!(decls.len(), 1);
    assert_eq!(decls[0].kind, ResourceKind::Secret);
}
