use crate::catalog::{ParamKind, ToolDef};
use crate::job::ToolSelection;
use anyhow::{bail, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Placeholders that all substitute the (quoted) target value. The aliases
/// exist so command templates can document what kind of target they expect.
const TARGET_PLACEHOLDERS: &[&str] = &[
    "{target}",
    "{target_domain}",
    "{target_url}",
    "{target_host_or_ip}",
    "{target_ip_range}",
    "{target_domain_or_ip}",
    "{target_wordpress_url}",
    "{target_joomla_url}",
    "{target_url_with_params}",
    "{target_url_with_lfi_fuzz_param}",
];

/// Placeholders resolving to list files under the job directory, for tools
/// that consume the output of earlier phases.
const JOB_FILE_PLACEHOLDERS: &[(&str, &str)] = &[
    ("{target_file_subdomains}", "subdomains.txt"),
    ("{target_file_live_hosts}", "live_hosts.txt"),
    ("{target_wordlist_file}", "wordlist.txt"),
];

const OUTPUT_PLACEHOLDERS: &[&str] = &[
    "{output_file}",
    "{output_file_base}",
    "{output_file_json}",
    "{output_file_xml}",
    "{output_file_dir}",
];

/// Paths and names a unit's command is rendered against.
pub struct CommandContext<'a> {
    pub target: &'a str,
    pub job_dir: &'a Path,
    pub output_dir: &'a Path,
    /// Output file stem unique to this unit, e.g. `nmap_10.0.0.5_1700000000`.
    pub file_base: &'a str,
}

#[derive(Debug, Clone)]
pub enum Invocation {
    /// Direct exec: argv[0] is the program.
    Argv(Vec<String>),
    /// Run through `sh -c` for tools that need pipes or globbing.
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub invocation: Invocation,
    /// Printable command line for logs and the status API.
    pub display: String,
    /// Where this unit's main artifact is expected.
    pub primary_output: PathBuf,
    /// True when the template names no output placeholder and stdout should
    /// be captured into `primary_output` instead.
    pub capture_stdout: bool,
}

fn quote(s: &str) -> String {
    shlex::try_quote(s).map(|c| c.into_owned()).unwrap_or_default()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Derive a filesystem-safe output file stem from a tool id and target.
pub fn output_file_base(tool_id: &str, target: &str) -> String {
    let sanitized: String = target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}", tool_id, sanitized)
}

/// Render a tool's command template against one target, applying the
/// submitted CLI parameter values and free-form additional arguments.
pub fn build_command(
    tool: &ToolDef,
    selection: &ToolSelection,
    ctx: &CommandContext<'_>,
) -> Result<BuiltCommand> {
    if tool.command_template.is_empty() {
        bail!("tool {} has no command template", tool.id);
    }

    let mut command = tool.command_template.clone();

    for placeholder in TARGET_PLACEHOLDERS {
        command = command.replace(placeholder, &quote(ctx.target));
    }
    for (placeholder, file_name) in JOB_FILE_PLACEHOLDERS {
        let path = ctx.job_dir.join(file_name);
        command = command.replace(placeholder, &quote(&path.to_string_lossy()));
    }

    let base = ctx.output_dir.join(ctx.file_base);
    let base_str = base.to_string_lossy();
    command = command.replace("{output_file}", &quote(&format!("{}.txt", base_str)));
    command = command.replace("{output_file_json}", &quote(&format!("{}.json", base_str)));
    command = command.replace("{output_file_xml}", &quote(&format!("{}.xml", base_str)));
    command = command.replace("{output_file_base}", &quote(&base_str));
    command = command.replace(
        "{output_file_dir}",
        &quote(&ctx.output_dir.to_string_lossy()),
    );

    for param in &tool.cli_params_config {
        let placeholder = format!("{{{}}}", param.name);
        let submitted = selection.cli_params.get(&param.name);

        let rendered = match param.kind {
            ParamKind::Checkbox => {
                let checked = submitted
                    .and_then(Value::as_bool)
                    .or_else(|| param.default.as_ref().and_then(Value::as_bool))
                    .unwrap_or(false);
                if checked {
                    param.cli_true.clone().unwrap_or_default()
                } else {
                    param.cli_false.clone().unwrap_or_default()
                }
            }
            ParamKind::Textarea => {
                let text = submitted
                    .map(value_to_string)
                    .or_else(|| param.default.as_ref().map(value_to_string))
                    .unwrap_or_default();
                let lines: Vec<&str> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                match &param.cli_format {
                    Some(format) => lines
                        .iter()
                        .map(|l| format.replace("{value}", &quote(l)))
                        .collect::<Vec<_>>()
                        .join(" "),
                    None => lines.iter().map(|l| quote(l)).collect::<Vec<_>>().join(" "),
                }
            }
            _ => {
                let mut value = submitted.map(value_to_string).unwrap_or_default();
                if value.trim().is_empty() {
                    value = param.default.as_ref().map(value_to_string).unwrap_or_default();
                }
                if value.trim().is_empty() {
                    String::new()
                } else {
                    quote(value.trim())
                }
            }
        };

        command = command.replace(&placeholder, rendered.trim());
    }

    // Any declared placeholder still present had no value at all; drop it.
    for param in &tool.cli_params_config {
        command = command.replace(&format!("{{{}}}", param.name), "");
    }
    let command = command.split_whitespace().collect::<Vec<_>>().join(" ");

    let has_output_placeholder = OUTPUT_PLACEHOLDERS
        .iter()
        .any(|p| tool.command_template.contains(p));
    let primary_output = if tool.command_template.contains("{output_file_json}") {
        ctx.output_dir.join(format!("{}.json", ctx.file_base))
    } else if tool.command_template.contains("{output_file_xml}") {
        ctx.output_dir.join(format!("{}.xml", ctx.file_base))
    } else if tool.command_template.contains("{output_file_dir}") {
        ctx.output_dir.to_path_buf()
    } else {
        ctx.output_dir.join(format!("{}.txt", ctx.file_base))
    };

    let extra = selection.additional_args.trim();

    if tool.needs_shell {
        let mut line = command;
        if !extra.is_empty() {
            let args = shlex::split(extra)
                .unwrap_or_else(|| extra.split_whitespace().map(String::from).collect());
            for arg in args {
                line.push(' ');
                line.push_str(&quote(&arg));
            }
        }
        Ok(BuiltCommand {
            display: line.clone(),
            invocation: Invocation::Shell(line),
            primary_output,
            capture_stdout: !has_output_placeholder,
        })
    } else {
        let mut argv = match shlex::split(&command) {
            Some(argv) if !argv.is_empty() => argv,
            _ => bail!("tool {} produced an unparseable command: {}", tool.id, command),
        };
        if !extra.is_empty() {
            let args = shlex::split(extra)
                .unwrap_or_else(|| extra.split_whitespace().map(String::from).collect());
            argv.extend(args);
        }
        let display = shlex::try_join(argv.iter().map(String::as_str))
            .unwrap_or_else(|_| argv.join(" "));
        Ok(BuiltCommand {
            invocation: Invocation::Argv(argv),
            display,
            primary_output,
            capture_stdout: !has_output_placeholder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CliParam};
    use std::collections::BTreeMap;

    fn tool(template: &str, params: Vec<CliParam>, needs_shell: bool) -> ToolDef {
        ToolDef {
            id: "t".to_string(),
            name: "Test Tool".to_string(),
            command_template: template.to_string(),
            target_type: "domain".to_string(),
            phase: "reconnaissance".to_string(),
            category: "Test".to_string(),
            category_display_name: String::new(),
            category_icon_class: String::new(),
            icon_class: String::new(),
            timeout: 60,
            default_enabled: true,
            description: String::new(),
            cli_params_config: params,
            allow_additional_args: true,
            additional_args_placeholder: None,
            dangerous: false,
            needs_shell,
        }
    }

    fn selection(params: &[(&str, Value)], extra: &str) -> ToolSelection {
        ToolSelection {
            id: "t".to_string(),
            cli_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            additional_args: extra.to_string(),
        }
    }

    fn ctx<'a>(target: &'a str, job: &'a Path, out: &'a Path) -> CommandContext<'a> {
        CommandContext {
            target,
            job_dir: job,
            output_dir: out,
            file_base: "t_example",
        }
    }

    #[test]
    fn substitutes_and_quotes_target() {
        let tool = tool("scan {target_domain}", Vec::new(), false);
        let built = build_command(
            &tool,
            &selection(&[], ""),
            &ctx("exa mple.com", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        match built.invocation {
            Invocation::Argv(argv) => assert_eq!(argv, vec!["scan", "exa mple.com"]),
            Invocation::Shell(_) => panic!("expected argv"),
        }
    }

    #[test]
    fn checkbox_renders_true_and_false_flags() {
        let params = vec![CliParam {
            name: "open".to_string(),
            label: String::new(),
            kind: ParamKind::Checkbox,
            default: Some(Value::Bool(false)),
            cli_true: Some("--open".to_string()),
            cli_false: Some(String::new()),
            cli_format: None,
            options: None,
        }];
        let tool = tool("scan {open} {target}", params, false);

        let on = build_command(
            &tool,
            &selection(&[("open", Value::Bool(true))], ""),
            &ctx("h", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        assert!(on.display.contains("--open"));

        let off = build_command(
            &tool,
            &selection(&[], ""),
            &ctx("h", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        assert!(!off.display.contains("--open"));
    }

    #[test]
    fn textarea_applies_cli_format_per_line() {
        let params = vec![CliParam {
            name: "headers".to_string(),
            label: String::new(),
            kind: ParamKind::Textarea,
            default: None,
            cli_true: None,
            cli_false: None,
            cli_format: Some("-H {value}".to_string()),
            options: None,
        }];
        let tool = tool("curl {headers} {target_url}", params, false);
        let built = build_command(
            &tool,
            &selection(
                &[("headers", Value::String("X-A: 1\n\n  X-B: 2  ".to_string()))],
                "",
            ),
            &ctx("http://x", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        match built.invocation {
            Invocation::Argv(argv) => {
                assert_eq!(argv.iter().filter(|a| *a == "-H").count(), 2);
                assert!(argv.contains(&"X-A: 1".to_string()));
                assert!(argv.contains(&"X-B: 2".to_string()));
            }
            Invocation::Shell(_) => panic!("expected argv"),
        }
    }

    #[test]
    fn missing_value_falls_back_to_default_then_empty() {
        let params = vec![
            CliParam {
                name: "rate".to_string(),
                label: String::new(),
                kind: ParamKind::Number,
                default: Some(Value::Number(50.into())),
                cli_true: None,
                cli_false: None,
                cli_format: None,
                options: None,
            },
            CliParam {
                name: "proxy".to_string(),
                label: String::new(),
                kind: ParamKind::Text,
                default: None,
                cli_true: None,
                cli_false: None,
                cli_format: None,
                options: None,
            },
        ];
        let tool = tool("run {rate} {proxy} {target}", params, false);
        let built = build_command(
            &tool,
            &selection(&[], ""),
            &ctx("h", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        // Default applied, valueless param stripped, whitespace collapsed.
        assert_eq!(built.display, "run 50 h");
    }

    #[test]
    fn additional_args_are_appended_to_argv() {
        let tool = tool("scan {target}", Vec::new(), false);
        let built = build_command(
            &tool,
            &selection(&[], "-x '1 2'"),
            &ctx("h", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        match built.invocation {
            Invocation::Argv(argv) => assert_eq!(argv, vec!["scan", "h", "-x", "1 2"]),
            Invocation::Shell(_) => panic!("expected argv"),
        }
    }

    #[test]
    fn shell_tools_produce_a_single_line() {
        let tool = tool("scan {target} | tee {output_file}", Vec::new(), true);
        let built = build_command(
            &tool,
            &selection(&[], "--flag"),
            &ctx("h", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        match built.invocation {
            Invocation::Shell(line) => {
                assert!(line.contains("| tee"));
                assert!(line.ends_with("--flag"));
            }
            Invocation::Argv(_) => panic!("expected shell"),
        }
        assert!(!built.capture_stdout);
    }

    #[test]
    fn output_placeholder_selects_primary_output() {
        let out = Path::new("/j/out");
        let cases = [
            ("a {target} -o {output_file_json}", "t_example.json"),
            ("a {target} -o {output_file_xml}", "t_example.xml"),
            ("a {target} -o {output_file}", "t_example.txt"),
        ];
        for (template, expected) in cases {
            let tool = tool(template, Vec::new(), false);
            let built =
                build_command(&tool, &selection(&[], ""), &ctx("h", Path::new("/j"), out))
                    .unwrap();
            assert_eq!(built.primary_output, out.join(expected));
            assert!(!built.capture_stdout);
        }
    }

    #[test]
    fn stdout_captured_when_no_output_placeholder() {
        let tool = tool("echo {target}", Vec::new(), false);
        let built = build_command(
            &tool,
            &selection(&[], ""),
            &ctx("h", Path::new("/j"), Path::new("/j/out")),
        )
        .unwrap();
        assert!(built.capture_stdout);
        assert_eq!(built.primary_output, Path::new("/j/out/t_example.txt"));
    }

    #[test]
    fn builtin_tools_all_render() {
        let catalog = Catalog::builtin();
        let job = Path::new("/jobs/abc");
        let out = Path::new("/jobs/abc/tool_outputs");
        for tool in catalog.tools.values() {
            let sel = ToolSelection {
                id: tool.id.clone(),
                cli_params: BTreeMap::new(),
                additional_args: String::new(),
            };
            let resolved = catalog.resolve_selections(vec![sel]).unwrap();
            let built = build_command(
                tool,
                &resolved[0],
                &CommandContext {
                    target: "example.com",
                    job_dir: job,
                    output_dir: out,
                    file_base: "base",
                },
            )
            .unwrap();
            assert!(!built.display.contains('{'), "unresolved placeholder: {}", built.display);
        }
    }

    #[test]
    fn file_base_is_sanitized() {
        assert_eq!(
            output_file_base("nmap", "http://10.0.0.5:8080/x"),
            "nmap_http___10.0.0.5_8080_x"
        );
    }
}
