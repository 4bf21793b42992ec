//! Recipe file parsing.

use crate::kdl_util::*;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use kiln_core::manifest::DependencyManifest;
use kiln_core::recipe::BuildRecipe;
use std::path::PathBuf;

/// Parse a recipe from KDL text and validate it.
pub fn parse_recipe(kdl: &str) -> ConfigResult<BuildRecipe> {
    let doc: KdlDocument = kdl.parse()?;

    let mut recipes = doc.nodes().iter().filter(|n| n.name().value() == "recipe");
    let node = recipes
        .next()
        .ok_or_else(|| ConfigError::MissingField("recipe".to_string()))?;
    if recipes.next().is_some() {
        return Err(ConfigError::Duplicate("recipe".to_string()));
    }

    let recipe = parse_recipe_node(node)?;
    recipe.validate()?;
    Ok(recipe)
}

/// Parse a requirements-style dependency manifest.
pub fn parse_manifest(content: &str) -> ConfigResult<DependencyManifest> {
    Ok(DependencyManifest::parse(content)?)
}

fn parse_recipe_node(node: &KdlNode) -> ConfigResult<BuildRecipe> {
    let name = require_string_arg(node, "recipe name")?;

    let mut base_image = None;
    let mut recipe = BuildRecipe::new(name, String::new());

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "base-image" | "from" => {
                    base_image = Some(require_string_arg(child, "base-image")?);
                }
                "packages" | "package" => {
                    for package in get_all_string_args(child) {
                        recipe.add_package(package);
                    }
                }
                "manifest" => {
                    recipe.manifest = Some(PathBuf::from(require_string_arg(child, "manifest")?));
                }
                "installer" => {
                    recipe.installer = require_string_arg(child, "installer")?;
                }
                "source" => {
                    recipe.source_root = PathBuf::from(require_string_arg(child, "source")?);
                }
                "workdir" => {
                    recipe.workdir = require_string_arg(child, "workdir")?;
                }
                "prepare" => {
                    recipe
                        .prepare_commands
                        .push(require_string_arg(child, "prepare command")?);
                }
                "build" => {
                    recipe
                        .build_commands
                        .push(require_string_arg(child, "build command")?);
                }
                "output" => {
                    recipe.output_dir = require_string_arg(child, "output")?;
                }
                "env" => {
                    let (key, value) = get_pair_args(child, "env")?;
                    if recipe.env.iter().any(|(k, _)| *k == key) {
                        return Err(ConfigError::Duplicate(format!("env {}", key)));
                    }
                    recipe.env.push((key, value));
                }
                "build-arg" => {
                    // A bare name is passed through from the runner's environment.
                    let (key, value) = match get_all_string_args(child).as_slice() {
                        [key] => (key.clone(), None),
                        [key, value] => (key.clone(), Some(value.clone())),
                        args => {
                            return Err(ConfigError::invalid(
                                "build-arg",
                                format!(
                                    "expected a name and an optional value, got {} arguments",
                                    args.len()
                                ),
                            ));
                        }
                    };
                    if recipe.build_args.iter().any(|(k, _)| *k == key) {
                        return Err(ConfigError::Duplicate(format!("build-arg {}", key)));
                    }
                    recipe.build_args.push((key, value));
                }
                _ => {} // Ignore unknown nodes
            }
        }
    }

    recipe.base_image =
        base_image.ok_or_else(|| ConfigError::MissingField("base-image".to_string()))?;

    Ok(recipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
        recipe "opensfm" {
            base-image "ubuntu:20.04"
            env "DEBIAN_FRONTEND" "noninteractive"
            packages "build-essential" "cmake" "git"
            packages "libeigen3-dev" "cmake"
            manifest "requirements.txt"
            source "."
            workdir "/source/OpenSfM"
            prepare "python3 setup.py build_ext --inplace"
            build "python3 setup.py bdist_wheel"
            output "/source/OpenSfM/dist"
        }
    "#;

    #[test]
    fn test_parse_recipe() {
        let recipe = parse_recipe(RECIPE).unwrap();
        assert_eq!(recipe.name, "opensfm");
        assert_eq!(recipe.base_image, "ubuntu:20.04");
        assert_eq!(
            recipe.system_packages,
            vec!["build-essential", "cmake", "git", "libeigen3-dev"]
        );
        assert_eq!(recipe.manifest, Some(PathBuf::from("requirements.txt")));
        assert_eq!(recipe.workdir, "/source/OpenSfM");
        assert_eq!(recipe.prepare_commands.len(), 1);
        assert_eq!(recipe.build_commands, vec!["python3 setup.py bdist_wheel"]);
        assert_eq!(recipe.output_path(), "/source/OpenSfM/dist");
        assert_eq!(
            recipe.env,
            vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]
        );
    }

    #[test]
    fn test_missing_base_image() {
        let kdl = r#"
            recipe "pkg" {
                build "make"
            }
        "#;
        assert!(matches!(
            parse_recipe(kdl),
            Err(ConfigError::MissingField(f)) if f == "base-image"
        ));
    }

    #[test]
    fn test_missing_recipe_node() {
        assert!(matches!(
            parse_recipe("pipeline \"x\""),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_package_fails_validation() {
        let kdl = r#"
            recipe "pkg" {
                base-image "ubuntu:jammy"
                packages "cmake" "bad package"
                build "make"
            }
        "#;
        assert!(matches!(
            parse_recipe(kdl),
            Err(ConfigError::Invalid(kiln_core::Error::Recipe(_)))
        ));
    }

    #[test]
    fn test_env_requires_pair() {
        let kdl = r#"
            recipe "pkg" {
                base-image "ubuntu:jammy"
                env "ONLY_KEY"
                build "make"
            }
        "#;
        assert!(matches!(
            parse_recipe(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_build_args_with_and_without_values() {
        let kdl = r#"
            recipe "pkg" {
                base-image "ubuntu:jammy"
                build-arg "CERES_VERSION" "2.0"
                build-arg "PIP_INDEX_URL"
                build "make"
            }
        "#;
        let recipe = parse_recipe(kdl).unwrap();
        assert_eq!(
            recipe.build_args,
            vec![
                ("CERES_VERSION".to_string(), Some("2.0".to_string())),
                ("PIP_INDEX_URL".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_build_arg_arity_and_duplicates() {
        let too_many = r#"
            recipe "pkg" {
                base-image "ubuntu:jammy"
                build-arg "A" "1" "2"
                build "make"
            }
        "#;
        assert!(matches!(
            parse_recipe(too_many),
            Err(ConfigError::InvalidValue { .. })
        ));

        let duplicate = r#"
            recipe "pkg" {
                base-image "ubuntu:jammy"
                build-arg "A"
                build-arg "A" "1"
                build "make"
            }
        "#;
        assert!(matches!(parse_recipe(duplicate), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_invalid_recipe_name_fails_validation() {
        let kdl = r#"
            recipe "my pkg" {
                base-image "ubuntu:jammy"
                build "make"
            }
        "#;
        assert!(matches!(
            parse_recipe(kdl),
            Err(ConfigError::Invalid(kiln_core::Error::Recipe(_)))
        ));
    }

    #[test]
    fn test_parse_manifest_errors_are_config_errors() {
        assert!(parse_manifest("numpy\nscipy==1.5\n").is_ok());
        assert!(matches!(
            parse_manifest("??\n"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
