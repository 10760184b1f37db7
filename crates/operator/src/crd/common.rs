/// Label on every child job naming the batch that created it
pub const LABEL_BATCH_NAME: &str = "jobbatch.dev/batch-name";

/// Label on every child job naming the template it was created from
pub const LABEL_TEMPLATE_NAME: &str = "jobbatch.dev/template-name";

/// Annotation on every child job holding "{namespace}/{batch}"
pub const ANNOTATION_OWNER: &str = "jobbatch.dev/owner";
