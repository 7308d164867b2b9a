//! The analytics dashboards deployment.
//!
//! Three groups:
//! - `search`: identity layer (user pool, identity pool, roles, admin user)
//!   and the search domain. Publishes `DomainEndpoint`, `DomainArn` and
//!   `DashboardsLink`.
//! - `ingestion`: log group and streams, the delivery bucket, the delivery
//!   role and the delivery stream into the search domain. Publishes
//!   `DeliveryStreamArn`.
//! - `app`: customizer and updater functions, three event rules that
//!   invoke the updater, and the `dashboardsCustomizer` custom resource.
//!
//! `ingestion` and `app` are nested under `search` and read its values only
//! through its outputs.

use stackwire_state::RemovalPolicy;

use crate::custom_resource::custom_resource;
use crate::error::DeployResult;
use crate::graph::{Composer, LogicalResource, ResourceKind, StackGroup, Value};
use crate::naming::{ArnSeparator, DeploymentContext};
use crate::params::Parameter;
use crate::policy::{build_role, PolicyStatement, Principal};
use crate::wiring::{
    bind_rule, wire_rule, CallbackTarget, EventPattern, EventRule, GrantRegistry,
};

pub const SEARCH_GROUP: &str = "search";
pub const INGESTION_GROUP: &str = "ingestion";
pub const APP_GROUP: &str = "app";

pub const WAF_INDEX: &str = "awswaf";
const COGNITO_ACCESS_POLICY: &str = "arn:aws:iam::aws:policy/AmazonOpenSearchServiceCognitoAccess";
const CODE_BUCKET: &str = "aws-waf-dashboard-resources";
const CODE_KEY: &str = "os-customizer-lambda.zip";
const STREAM_BUFFER_MB: u32 = 5;
const STREAM_BUFFER_SECS: u32 = 60;

/// Parameters of the dashboards deployment.
pub fn dashboards_parameters() -> Vec<Parameter> {
    vec![
        Parameter::number("dataNodeEBSVolumeSize", 10.0, "Search domain volume size in GiB")
            .with_range(10.0, 3584.0),
        Parameter::string("nodeType", "r6g.large", "Search domain node type")
            .with_allowed_pattern(r"[a-z0-9]+\.[a-z0-9]+"),
        Parameter::string("openSearchDomainName", "waf-dashboards", "Search domain name")
            .with_allowed_pattern(r"[a-z][a-z0-9\-]{2,27}"),
        Parameter::string("userEmail", "your@email.com", "Dashboard user e-mail address")
            .with_allowed_pattern(r"[^@\s]+@[^@\s]+\.[^@\s]+"),
        Parameter::string("cognitoDomainName", "os-waf-dashboard-domain", "Name for the sign-in domain")
            .with_allowed_pattern(r"[a-z0-9](?:[a-z0-9\-]*[a-z0-9])?")
            .lowercase_only(),
    ]
}

/// Compose the dashboards deployment. Invoke grants for the event rules are
/// recorded in `grants`.
pub fn dashboards(ctx: &DeploymentContext, grants: &mut GrantRegistry) -> DeployResult<Composer> {
    let mut composer = Composer::new();
    composer.add_group(search_group(ctx)?)?;
    composer.add_group(ingestion_group(ctx)?)?;
    composer.add_group(app_group(ctx, grants)?)?;
    Ok(composer)
}

fn search_group(ctx: &DeploymentContext) -> DeployResult<StackGroup> {
    let mut group = StackGroup::new(SEARCH_GROUP);
    for parameter in dashboards_parameters() {
        group.add_parameter(parameter);
    }

    group.add_resource(
        LogicalResource::new("userPool", ResourceKind::UserPool)
            .with_property("UserPoolName", ctx.resolve_name("WAFKibanaUsers"))
            .with_property(
                "AccountRecoverySetting",
                Value::map([(
                    "RecoveryMechanisms",
                    Value::list([Value::map([
                        ("Name", Value::lit("verified_email")),
                        ("Priority", Value::lit(1u32)),
                    ])]),
                )]),
            )
            .with_property("AutoVerifiedAttributes", vec!["email"])
            .with_property(
                "Policies",
                Value::map([(
                    "PasswordPolicy",
                    Value::map([("MinimumLength", Value::lit(8u32))]),
                )]),
            )
            .with_property(
                "Schema",
                Value::list([Value::map([
                    ("Name", Value::lit("email")),
                    ("Required", Value::lit(true)),
                ])]),
            ),
    )?;

    group.add_resource(
        LogicalResource::new("userPoolDomain", ResourceKind::UserPoolDomain)
            .with_property("Domain", Value::param("cognitoDomainName"))
            .with_property("UserPoolId", Value::attr("userPool", "UserPoolId")),
    )?;

    group.add_resource(
        LogicalResource::new("identityPool", ResourceKind::IdentityPool)
            .with_property("IdentityPoolName", ctx.resolve_name("WAFKibanaIdentityPool"))
            .with_property("AllowUnauthenticatedIdentities", false),
    )?;

    let authenticated = build_role(
        ctx.resolve_name("wafDashboardAnonCognitoGroupRole"),
        Principal::web_identity("cognito-identity.amazonaws.com")
            .with_condition(
                "StringEquals",
                "cognito-identity.amazonaws.com:aud",
                Value::attr("identityPool", "Ref"),
            )
            .with_condition(
                "ForAnyValue:StringLike",
                "cognito-identity.amazonaws.com:amr",
                "authenticated",
            ),
        [],
    )
    .with_managed_policy(COGNITO_ACCESS_POLICY);
    group.add_role("authenticatedRole", authenticated)?;

    group.add_resource(
        LogicalResource::new("identityPoolRoleAttachment", ResourceKind::IdentityPoolRoleAttachment)
            .with_property("IdentityPoolId", Value::attr("identityPool", "Ref"))
            .with_property(
                "Roles",
                Value::map([("authenticated", Value::attr("authenticatedRole", "Arn"))]),
            ),
    )?;

    group.add_resource(
        LogicalResource::new("adminUser", ResourceKind::UserPoolUser)
            .with_property("UserPoolId", Value::attr("userPool", "UserPoolId"))
            .with_property("Username", Value::param("userEmail"))
            .with_property("ForceAliasCreation", true)
            .with_property("DesiredDeliveryMediums", vec!["EMAIL"])
            .with_property(
                "UserAttributes",
                Value::list([Value::map([
                    ("Name", Value::lit("email")),
                    ("Value", Value::param("userEmail")),
                ])]),
            ),
    )?;

    let cognito_config = build_role(
        ctx.resolve_name("AuthenticatedRole"),
        Principal::service("es.amazonaws.com"),
        [],
    )
    .with_description("Role attached to Cognito authenticated users")
    .with_max_session_duration(2 * 60 * 60)
    .with_managed_policy(COGNITO_ACCESS_POLICY);
    group.add_role("cognitoConfigRole", cognito_config)?;

    let domain_objects = ctx.arn_value(
        "es",
        "domain",
        Value::join([Value::param("openSearchDomainName"), Value::lit("/*")]),
    )?;
    let access = PolicyStatement::allow()
        .with_principal(Principal::arn(Value::attr("authenticatedRole", "Arn")))
        .with_action("es:ESHttp*")
        .with_resource(domain_objects);

    group.add_resource(
        LogicalResource::new("domain", ResourceKind::SearchDomain)
            .with_property("DomainName", Value::param("openSearchDomainName"))
            .with_property("EngineVersion", "OpenSearch_1.0")
            .with_property(
                "ClusterConfig",
                Value::map([
                    (
                        "InstanceType",
                        Value::join([Value::param("nodeType"), Value::lit(".search")]),
                    ),
                    ("InstanceCount", Value::lit(1u32)),
                    ("DedicatedMasterEnabled", Value::lit(false)),
                    ("WarmEnabled", Value::lit(false)),
                ]),
            )
            .with_property(
                "EBSOptions",
                Value::map([
                    ("EBSEnabled", Value::lit(true)),
                    ("VolumeSize", Value::param("dataNodeEBSVolumeSize")),
                    ("VolumeType", Value::lit("gp2")),
                ]),
            )
            .with_property(
                "SnapshotOptions",
                Value::map([("AutomatedSnapshotStartHour", Value::lit(0u32))]),
            )
            .with_property(
                "CognitoOptions",
                Value::map([
                    ("Enabled", Value::lit(true)),
                    ("IdentityPoolId", Value::attr("identityPool", "Ref")),
                    ("UserPoolId", Value::attr("userPool", "UserPoolId")),
                    ("RoleArn", Value::attr("cognitoConfigRole", "Arn")),
                ]),
            )
            .with_property(
                "AccessPolicies",
                Value::map([
                    ("Version", Value::lit("2012-10-17")),
                    ("Statement", Value::list([access.to_value()])),
                ]),
            )
            // Dashboards sign-in needs the hosted domain in place first.
            .depends_on("userPoolDomain"),
    )?;

    group.add_output("DomainEndpoint", Value::attr("domain", "DomainEndpoint"));
    group.add_output("DomainArn", Value::attr("domain", "DomainArn"));
    group.add_output(
        "DashboardsLink",
        Value::join([
            Value::lit("https://"),
            Value::attr("domain", "DomainEndpoint"),
            Value::lit("/_dashboards"),
        ]),
    );
    Ok(group)
}

fn logging_options(stream_id: &str) -> Value {
    Value::map([
        ("Enabled", Value::lit(true)),
        ("LogGroupName", Value::attr("logGroup", "Ref")),
        ("LogStreamName", Value::attr(stream_id, "Ref")),
    ])
}

fn ingestion_group(ctx: &DeploymentContext) -> DeployResult<StackGroup> {
    let mut group = StackGroup::new(INGESTION_GROUP).nested_under(SEARCH_GROUP);
    let domain_arn = || Value::output(SEARCH_GROUP, "DomainArn");
    let under_domain = |suffix: &str| Value::join([domain_arn(), Value::lit(suffix)]);

    group.add_resource(
        LogicalResource::new("logGroup", ResourceKind::LogGroup)
            .with_property("LogGroupName", ctx.resolve_name("wafLogsDeliveryStreamCW"))
            .with_property("RetentionInDays", 30u32),
    )?;
    for (id, name) in [
        ("s3LogStream", "s3-delivery-log"),
        ("openSearchLogStream", "openSearch-delivery-log"),
    ] {
        group.add_resource(
            LogicalResource::new(id, ResourceKind::LogStream)
                .with_property("LogGroupName", Value::attr("logGroup", "Ref"))
                .with_property("LogStreamName", name),
        )?;
    }

    group.add_resource(
        LogicalResource::new("deliveryBucket", ResourceKind::Bucket)
            .with_property(
                "BucketName",
                ctx.resolve_name("waf-log-delivery-bucket-").to_lowercase(),
            )
            .with_removal_policy(RemovalPolicy::Retain),
    )?;

    let bucket_arn = Value::attr("deliveryBucket", "Arn");
    let statements = [
        PolicyStatement::allow()
            .with_sid("s3AccessStatement")
            .with_actions([
                "s3:AbortMultipartUpload",
                "s3:GetBucketLocation",
                "s3:GetObject",
                "s3:ListBucket",
                "s3:ListBucketMultipartUploads",
                "s3:PutObject",
            ])
            .with_resources([
                bucket_arn.clone(),
                Value::join([bucket_arn.clone(), Value::lit("/*")]),
            ]),
        PolicyStatement::allow()
            .with_sid("openSearchPutAccessStatement")
            .with_actions([
                "es:DescribeElasticsearchDomain",
                "es:DescribeElasticsearchDomains",
                "es:DescribeElasticsearchDomainConfig",
                "es:ESHttpPost",
                "es:ESHttpPut",
            ])
            .with_resources([domain_arn(), under_domain("/*")]),
        PolicyStatement::allow()
            .with_sid("openSearchMiscGetAccessStatement")
            .with_action("es:ESHttpGet")
            .with_resources(
                [
                    "/_all/_settings".to_string(),
                    "/_cluster/stats".to_string(),
                    format!("/{WAF_INDEX}/_mapping/*"),
                    "/_nodes".to_string(),
                    "/_nodes/stats".to_string(),
                    "/_nodes/*/stats".to_string(),
                    "/_stats".to_string(),
                    format!("/{WAF_INDEX}/_stats"),
                ]
                .iter()
                .map(|suffix| under_domain(suffix.as_str())),
            ),
        PolicyStatement::allow()
            .with_sid("cwLogDeliveryAccessStatement")
            .with_action("logs:PutLogEvents")
            .with_resource(Value::join([Value::attr("logGroup", "Arn"), Value::lit(":*")])),
    ];
    let role = build_role(
        ctx.resolve_name("waf-dashboard-wafLogsDeliveryStream"),
        Principal::service("firehose.amazonaws.com"),
        statements,
    )
    .with_description("Role for WAF Dashboards log delivery");
    group.add_role("deliveryRole", role)?;

    let role_arn = Value::attr("deliveryRole", "Arn");
    group.add_resource(
        LogicalResource::new("deliveryStream", ResourceKind::DeliveryStream)
            .with_property("DeliveryStreamName", ctx.resolve_name("waf-logs-delivery-stream"))
            .with_property("DeliveryStreamType", "DirectPut")
            .with_property(
                "ElasticsearchDestinationConfiguration",
                Value::map([
                    (
                        "BufferingHints",
                        Value::map([
                            ("IntervalInSeconds", Value::lit(STREAM_BUFFER_SECS)),
                            ("SizeInMBs", Value::lit(STREAM_BUFFER_MB)),
                        ]),
                    ),
                    ("CloudWatchLoggingOptions", logging_options("openSearchLogStream")),
                    ("DomainARN", domain_arn()),
                    ("IndexName", Value::lit(WAF_INDEX)),
                    ("IndexRotationPeriod", Value::lit("OneDay")),
                    (
                        "RetryOptions",
                        Value::map([("DurationInSeconds", Value::lit(60u32))]),
                    ),
                    ("RoleARN", role_arn.clone()),
                    ("S3BackupMode", Value::lit("AllDocuments")),
                    (
                        "S3Configuration",
                        Value::map([
                            ("BucketARN", bucket_arn),
                            (
                                "BufferingHints",
                                Value::map([
                                    ("IntervalInSeconds", Value::lit(STREAM_BUFFER_SECS * 5)),
                                    ("SizeInMBs", Value::lit(STREAM_BUFFER_MB * 10)),
                                ]),
                            ),
                            ("CompressionFormat", Value::lit("ZIP")),
                            ("Prefix", Value::lit("/log")),
                            ("RoleARN", role_arn),
                            ("CloudWatchLoggingOptions", logging_options("s3LogStream")),
                        ]),
                    ),
                ]),
            ),
    )?;

    group.add_output("DeliveryStreamArn", Value::attr("deliveryStream", "Arn"));
    Ok(group)
}

fn function(ctx: &DeploymentContext, id: &str, name: &str, handler: &str, description: &str) -> LogicalResource {
    LogicalResource::new(id, ResourceKind::Function)
        .with_property("FunctionName", ctx.resolve_name(name))
        .with_property("Description", description)
        .with_property("Handler", handler)
        .with_property("Runtime", "python3.9")
        .with_property("Architectures", vec!["arm64"])
        .with_property("MemorySize", 128u32)
        .with_property("Timeout", 160u32)
        .with_property("Role", Value::attr("customizerRole", "Arn"))
        .with_property(
            "Code",
            Value::map([
                ("S3Bucket", Value::lit(CODE_BUCKET)),
                ("S3Key", Value::lit(CODE_KEY)),
            ]),
        )
        .with_property(
            "Environment",
            Value::map([(
                "Variables",
                Value::map([
                    ("ES_ENDPOINT", Value::output(SEARCH_GROUP, "DomainEndpoint")),
                    ("REGION", Value::lit(ctx.region.as_str())),
                    ("ACCOUNT_ID", Value::lit(ctx.account.as_str())),
                ]),
            )]),
        )
}

fn detect_rule(id: &str, name: &str, source: &str, event_source: &str, label: &str) -> EventRule {
    bind_rule(
        id,
        name,
        EventPattern::new()
            .with_source(source)
            .with_detail_type("AWS API Call via CloudTrail")
            .with_detail("eventSource", [event_source])
            .with_detail("eventName", ["CreateWebACL", "CreateRule"]),
        CallbackTarget::function("updaterFunction"),
    )
    .with_description(format!(
        "WAF Dashboards - detects new WebACLs and rules for {label}."
    ))
}

fn app_group(ctx: &DeploymentContext, grants: &mut GrantRegistry) -> DeployResult<StackGroup> {
    let mut group = StackGroup::new(APP_GROUP).nested_under(SEARCH_GROUP);

    let statements = [
        PolicyStatement::allow()
            .with_sid("domainConfig")
            .with_action("es:UpdateElasticsearchDomainConfig")
            .with_resource(Value::output(SEARCH_GROUP, "DomainArn")),
        PolicyStatement::allow()
            .with_sid("functionLogs")
            .with_actions(["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"])
            .with_resource(ctx.arn("logs", "log-group", Some("/aws/lambda/*"), ArnSeparator::Colon)?),
        PolicyStatement::allow()
            .with_sid("eventRules")
            .with_actions([
                "events:PutRule",
                "events:DeleteRule",
                "events:PutTargets",
                "events:RemoveTargets",
            ])
            .with_resource(ctx.arn("events", "rule", Some("*"), ArnSeparator::Slash)?),
        PolicyStatement::allow()
            .with_sid("functionPermissions")
            .with_actions(["lambda:AddPermission", "lambda:RemovePermission"])
            .with_resource(ctx.arn("lambda", "function", Some("*"), ArnSeparator::Colon)?),
        PolicyStatement::allow()
            .with_sid("passRole")
            .with_action("iam:PassRole")
            .with_resource(format!("arn:{}:iam::{}:role/*", ctx.partition, ctx.account)),
        PolicyStatement::allow()
            .with_sid("listAcls")
            .with_actions([
                "waf:ListWebACLs",
                "waf-regional:ListWebACLs",
                "waf:ListRules",
                "waf-regional:ListRules",
                "wafv2:ListWebACLs",
            ])
            .with_resource("*"),
        PolicyStatement::allow()
            .with_sid("readCode")
            .with_action("s3:GetObject")
            .with_resource(format!("arn:{}:s3:::{CODE_BUCKET}/*", ctx.partition)),
    ];
    let role = build_role(
        ctx.resolve_name("awafd-customizer-lambda-role"),
        Principal::service("lambda.amazonaws.com"),
        statements,
    )
    .with_description("WAF Dashboards function role");
    group.add_role("customizerRole", role)?;

    group.add_resource(function(
        ctx,
        "customizerFunction",
        "dashboardsCustomizerLambda",
        "src/lambda_function.handler",
        "WAF Dashboards main function",
    ))?;
    group.add_resource(function(
        ctx,
        "updaterFunction",
        "dashboardsUpdaterLambda",
        "src/lambda_function.update",
        "WAF Dashboards updater function",
    ))?;

    let rules = [
        detect_rule(
            "newAclsRulesForWafRegional",
            &ctx.resolve_name("awafd-waf-detect-acls-rules-regional"),
            "aws.waf-regional",
            "waf-regional.amazonaws.com",
            "WAF Regional",
        ),
        detect_rule(
            "newAclsRulesForWafGlobal",
            &ctx.resolve_name("awafd-waf-detect-acls-rules-global"),
            "aws.waf",
            "waf.amazonaws.com",
            "WAF Global",
        ),
        detect_rule(
            "newAclsForWafV2",
            &ctx.resolve_name("awafd-waf2-detect-acls"),
            "aws.wafv2",
            "wafv2.amazonaws.com",
            "WAFv2",
        ),
    ];
    for rule in &rules {
        wire_rule(&mut group, grants, rule)?;
    }

    group.add_resource(
        custom_resource("dashboardsCustomizer", Value::attr("customizerFunction", "Arn"))
            .with_property("StackName", ctx.deployment_id.as_str())
            .with_property("Region", ctx.region.as_str())
            .with_property("Host", Value::output(SEARCH_GROUP, "DomainEndpoint"))
            .with_property("AccountID", ctx.account.as_str())
            .with_property(
                "DeliveryStreamArn",
                Value::output(INGESTION_GROUP, "DeliveryStreamArn"),
            )
            .with_removal_policy(RemovalPolicy::Destroy),
    )?;
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use crate::naming::UniquenessToken;
    use stackwire_state::DeploymentId;
    use std::collections::BTreeMap;

    fn context() -> DeploymentContext {
        DeploymentContext::new(
            DeploymentId::new("dashboards"),
            UniquenessToken::parse("a1b2c3d4e5").unwrap(),
            &DeployConfig::default(),
        )
    }

    #[test]
    fn default_parameters_validate() {
        for parameter in dashboards_parameters() {
            parameter.validate(&parameter.default_value).unwrap();
        }
    }

    #[test]
    fn node_type_with_search_suffix_is_rejected() {
        let mut grants = GrantRegistry::new();
        let composer = dashboards(&context(), &mut grants).unwrap();
        let overrides = BTreeMap::from([("nodeType".to_string(), "r6g.large.search".to_string())]);
        assert!(composer.plan(&overrides).is_err());
    }

    #[test]
    fn uppercase_sign_in_domain_is_rejected() {
        let mut grants = GrantRegistry::new();
        let composer = dashboards(&context(), &mut grants).unwrap();
        let overrides =
            BTreeMap::from([("cognitoDomainName".to_string(), "My-Domain".to_string())]);
        assert!(composer.plan(&overrides).is_err());
    }

    #[test]
    fn search_settles_before_ingestion_and_customizer_runs_last() {
        let mut grants = GrantRegistry::new();
        let composer = dashboards(&context(), &mut grants).unwrap();
        let plan = composer.plan(&BTreeMap::new()).unwrap();
        let order = plan.order();
        let pos = |a: &str| order.iter().position(|x| *x == a).unwrap();

        assert!(pos("search/domain") < pos("ingestion/deliveryStream"));
        assert!(pos("search/domain") < pos("app/customizerFunction"));
        assert!(pos("ingestion/deliveryStream") < pos("app/dashboardsCustomizer"));
        let customizer = plan.step("app/dashboardsCustomizer").unwrap();
        let upstream = plan
            .steps
            .iter()
            .filter(|s| s.group != APP_GROUP)
            .map(|s| s.level)
            .max()
            .unwrap();
        assert!(customizer.level > upstream);
    }

    #[test]
    fn one_grant_per_rule_on_the_updater() {
        let mut grants = GrantRegistry::new();
        let composer = dashboards(&context(), &mut grants).unwrap();
        let updater = CallbackTarget::function("updaterFunction");
        assert_eq!(grants.grants_for(&updater).len(), 3);
        let app = composer.group(APP_GROUP).unwrap();
        let permissions = app
            .resources()
            .iter()
            .filter(|r| r.kind == ResourceKind::Permission)
            .count();
        assert_eq!(permissions, 3);
    }

    #[test]
    fn shipped_roles_are_least_privilege() {
        let mut grants = GrantRegistry::new();
        let composer = dashboards(&context(), &mut grants).unwrap();
        let plan = composer.plan(&BTreeMap::new()).unwrap();
        assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);
    }
}
