//! Picks the build command for a checkout.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSystem {
    MavenWrapper,
    Maven,
    GradleWrapper,
    Gradle,
}

impl BuildSystem {
    pub fn command(self) -> &'static str {
        match self {
            BuildSystem::MavenWrapper => "sh ./mvnw -B -q compile test",
            BuildSystem::Maven => "mvn -B -q compile test",
            BuildSystem::GradleWrapper => "sh ./gradlew build --console=plain",
            BuildSystem::Gradle => "gradle build --console=plain",
        }
    }

    /// Executable that must be on PATH for `command()` to work.
    pub fn required_tool(self) -> Option<&'static str> {
        match self {
            BuildSystem::Maven => Some("mvn"),
            BuildSystem::Gradle => Some("gradle"),
            BuildSystem::MavenWrapper | BuildSystem::GradleWrapper => None,
        }
    }
}

/// Maven wins over Gradle when both are present.
pub fn detect(repo: &Path) -> Option<BuildSystem> {
    if repo.join("pom.xml").is_file() {
        return Some(if repo.join("mvnw").is_file() {
            BuildSystem::MavenWrapper
        } else {
            BuildSystem::Maven
        });
    }

    let gradle = ["build.gradle", "build.gradle.kts", "settings.gradle", "settings.gradle.kts"]
        .iter()
        .any(|f| repo.join(f).is_file());
    if gradle {
        return Some(if repo.join("gradlew").is_file() {
            BuildSystem::GradleWrapper
        } else {
            BuildSystem::Gradle
        });
    }

    None
}
