//! Database engines, schemas and users.

use super::{write_file, APT};
use crate::model::DatabaseEngine;
use crate::transport::RemoteCommand;
use crate::utils::shell_quote;

/// MySQL and MariaDB treat backslash as an escape inside string literals.
fn mysql_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// PostgreSQL literal under `standard_conforming_strings`: only quotes are
/// special.
fn pg_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn mysql_ident(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

fn pg_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Runs `sql` as the database superuser.
fn run_sql(engine: DatabaseEngine, root_password: &str, sql: &str) -> RemoteCommand {
    match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => RemoteCommand::new(format!(
            "MYSQL_PWD={} mysql -uroot -e {}",
            shell_quote(root_password),
            shell_quote(sql)
        )),
        DatabaseEngine::Postgresql => RemoteCommand::new(format!(
            "sudo -u postgres psql -v ON_ERROR_STOP=1 -c {}",
            shell_quote(sql)
        )),
    }
}

fn config_file(engine: DatabaseEngine, version: &str) -> String {
    match engine {
        DatabaseEngine::Mysql => "/etc/mysql/mysql.conf.d/mysqld.cnf".to_string(),
        DatabaseEngine::Mariadb => "/etc/mysql/mariadb.conf.d/50-server.cnf".to_string(),
        DatabaseEngine::Postgresql => format!("/etc/postgresql/{}/main/postgresql.conf", version),
    }
}

fn packages(engine: DatabaseEngine, version: &str) -> String {
    match engine {
        DatabaseEngine::Mysql => "mysql-server mysql-client".to_string(),
        DatabaseEngine::Mariadb => "mariadb-server mariadb-client".to_string(),
        DatabaseEngine::Postgresql => format!("postgresql-{} postgresql-client-{}", version, version),
    }
}

fn set_port(engine: DatabaseEngine, version: &str, port: u16) -> RemoteCommand {
    let file = config_file(engine, version);
    let script = match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => format!(
            "if grep -qE '^\\s*port\\s*=' {file}; then sed -i -E 's/^\\s*port\\s*=.*/port = {port}/' {file}; \
             else sed -i '/^\\[mysqld\\]/a port = {port}' {file}; fi",
            file = file,
            port = port
        ),
        DatabaseEngine::Postgresql => format!(
            "sed -i -E \"s/^#?port = [0-9]+/port = {port}/\" {file}",
            file = file,
            port = port
        ),
    };
    RemoteCommand::new(script)
}

pub(super) fn install_engine(
    engine: DatabaseEngine,
    version: &str,
    port: u16,
    root_password: &str,
) -> Vec<RemoteCommand> {
    let service = engine.service_name();
    let mut commands = vec![];

    if engine == DatabaseEngine::Postgresql {
        commands.push(RemoteCommand::new(format!(
            "{apt} install -y postgresql-common && /usr/share/postgresql-common/pgdg/apt.postgresql.org.sh -y",
            apt = APT
        )));
    }

    commands.push(RemoteCommand::new(format!(
        "{apt} update -y && {apt} install -y {packages}",
        apt = APT,
        packages = packages(engine, version)
    )));
    commands.push(set_port(engine, version, port));
    commands.push(RemoteCommand::new(format!(
        "systemctl enable {service} && systemctl restart {service}",
        service = service
    )));

    let root_sql = match engine {
        DatabaseEngine::Mysql => format!(
            "ALTER USER 'root'@'localhost' IDENTIFIED WITH caching_sha2_password BY {}; FLUSH PRIVILEGES;",
            mysql_string(root_password)
        ),
        DatabaseEngine::Mariadb => format!(
            "ALTER USER 'root'@'localhost' IDENTIFIED BY {}; FLUSH PRIVILEGES;",
            mysql_string(root_password)
        ),
        DatabaseEngine::Postgresql => {
            format!("ALTER USER postgres PASSWORD {};", pg_string(root_password))
        }
    };
    // The fresh install authenticates root over the unix socket.
    commands.push(match engine {
        DatabaseEngine::Postgresql => run_sql(engine, root_password, &root_sql),
        _ => RemoteCommand::new(format!("mysql -uroot -e {}", shell_quote(&root_sql))),
    });
    if engine != DatabaseEngine::Postgresql {
        commands.push(root_client_config(root_password));
    }

    commands
}

pub(super) fn update_engine(engine: DatabaseEngine, version: &str, port: u16) -> Vec<RemoteCommand> {
    let service = engine.service_name();
    vec![
        RemoteCommand::new(format!(
            "{apt} update -y && {apt} install -y --only-upgrade {packages}",
            apt = APT,
            packages = packages(engine, version)
        )),
        set_port(engine, version, port),
        RemoteCommand::new(format!("systemctl restart {}", service)),
    ]
}

pub(super) fn remove_engine(engine: DatabaseEngine) -> Vec<RemoteCommand> {
    let pattern = match engine {
        DatabaseEngine::Mysql => "'mysql-*'",
        DatabaseEngine::Mariadb => "'mariadb-*'",
        DatabaseEngine::Postgresql => "'postgresql-*'",
    };
    vec![
        RemoteCommand::best_effort(format!("systemctl stop {}", engine.service_name())),
        RemoteCommand::new(format!(
            "{apt} purge -y {pattern} && {apt} autoremove -y",
            apt = APT,
            pattern = pattern
        )),
    ]
}

pub(super) fn create_schema(
    engine: DatabaseEngine,
    name: &str,
    charset: &str,
    root_password: &str,
) -> Vec<RemoteCommand> {
    let sql = match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => format!(
            "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET {};",
            mysql_ident(name),
            charset
        ),
        DatabaseEngine::Postgresql => {
            format!("CREATE DATABASE {} ENCODING 'UTF8';", pg_ident(name))
        }
    };
    vec![run_sql(engine, root_password, &sql)]
}

pub(super) fn drop_schema(engine: DatabaseEngine, name: &str, root_password: &str) -> Vec<RemoteCommand> {
    let sql = match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => {
            format!("DROP DATABASE IF EXISTS {};", mysql_ident(name))
        }
        DatabaseEngine::Postgresql => format!("DROP DATABASE IF EXISTS {};", pg_ident(name)),
    };
    vec![run_sql(engine, root_password, &sql)]
}

fn grants(engine: DatabaseEngine, username: &str, host: &str, databases: &[String]) -> Vec<String> {
    databases
        .iter()
        .map(|db| match engine {
            DatabaseEngine::Mysql | DatabaseEngine::Mariadb => format!(
                "GRANT ALL PRIVILEGES ON {}.* TO {}@{};",
                mysql_ident(db),
                mysql_string(username),
                mysql_string(host)
            ),
            DatabaseEngine::Postgresql => format!(
                "GRANT ALL PRIVILEGES ON DATABASE {} TO {};",
                pg_ident(db),
                pg_ident(username)
            ),
        })
        .collect()
}

pub(super) fn create_user(
    engine: DatabaseEngine,
    username: &str,
    password: &str,
    host: &str,
    databases: &[String],
    root_password: &str,
) -> Vec<RemoteCommand> {
    let mut statements = vec![match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => format!(
            "CREATE USER IF NOT EXISTS {}@{} IDENTIFIED BY {};",
            mysql_string(username),
            mysql_string(host),
            mysql_string(password)
        ),
        DatabaseEngine::Postgresql => format!(
            "CREATE ROLE {} LOGIN PASSWORD {};",
            pg_ident(username),
            pg_string(password)
        ),
    }];
    statements.extend(grants(engine, username, host, databases));
    if engine != DatabaseEngine::Postgresql {
        statements.push("FLUSH PRIVILEGES;".to_string());
    }
    vec![run_sql(engine, root_password, &statements.join(" "))]
}

pub(super) fn update_user(
    engine: DatabaseEngine,
    username: &str,
    password: &str,
    host: &str,
    databases: &[String],
    root_password: &str,
) -> Vec<RemoteCommand> {
    let mut statements = match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => vec![
            format!(
                "ALTER USER {}@{} IDENTIFIED BY {};",
                mysql_string(username),
                mysql_string(host),
                mysql_string(password)
            ),
            format!(
                "REVOKE ALL PRIVILEGES, GRANT OPTION FROM {}@{};",
                mysql_string(username),
                mysql_string(host)
            ),
        ],
        DatabaseEngine::Postgresql => vec![format!(
            "ALTER ROLE {} PASSWORD {};",
            pg_ident(username),
            pg_string(password)
        )],
    };
    statements.extend(grants(engine, username, host, databases));
    if engine != DatabaseEngine::Postgresql {
        statements.push("FLUSH PRIVILEGES;".to_string());
    }
    vec![run_sql(engine, root_password, &statements.join(" "))]
}

pub(super) fn drop_user(
    engine: DatabaseEngine,
    username: &str,
    host: &str,
    root_password: &str,
) -> Vec<RemoteCommand> {
    let sql = match engine {
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => format!(
            "DROP USER IF EXISTS {}@{}; FLUSH PRIVILEGES;",
            mysql_string(username),
            mysql_string(host)
        ),
        DatabaseEngine::Postgresql => format!("DROP ROLE IF EXISTS {};", pg_ident(username)),
    };
    vec![run_sql(engine, root_password, &sql)]
}

/// Client credentials file for the superuser, so interactive sessions on
/// the host need no password on the command line.
fn root_client_config(root_password: &str) -> RemoteCommand {
    RemoteCommand::new(format!(
        "{} && chmod 600 /root/.my.cnf",
        write_file(
            "/root/.my.cnf",
            &format!("[client]\nuser=root\npassword={}\n", root_password)
        )
    ))
}

pub(super) fn classify(stderr: &str) -> Option<&'static str> {
    if stderr.contains("Access denied for user 'root'") {
        Some("The database root password stored for this server was rejected. Reset it on the server or retry provisioning.")
    } else if stderr.contains("Can't connect to local MySQL server")
        || stderr.contains("could not connect to server")
    {
        Some("The database service is not running. Start it with systemctl and retry.")
    } else if stderr.contains("database exists") || stderr.contains("already exists") {
        Some("An object with this name already exists on the database server.")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::tests::script;

    #[test]
    fn test_mysql_user_grants_each_database() {
        let commands = create_user(
            DatabaseEngine::Mysql,
            "shop",
            "pa'ss",
            "localhost",
            &["shop".to_string(), "shop_test".to_string()],
            "rootpw",
        );
        let script = script(&commands);
        assert!(script.starts_with("MYSQL_PWD='rootpw' mysql -uroot -e"));
        assert!(script.contains("GRANT ALL PRIVILEGES ON `shop`.*"));
        assert!(script.contains("GRANT ALL PRIVILEGES ON `shop_test`.*"));
        // quote doubled for SQL, then escaped for the shell
        assert!(script.contains("pa'\\'''\\''ss"));
    }

    #[test]
    fn test_backslash_escaping_follows_engine() {
        assert_eq!(mysql_string("back\\slash"), "'back\\\\slash'");
        assert_eq!(pg_string("back\\slash"), "'back\\slash'");
        assert_eq!(pg_string("it's"), "'it''s'");

        let postgres = script(&create_user(
            DatabaseEngine::Postgresql,
            "shop",
            "back\\slash",
            "localhost",
            &[],
            "rootpw",
        ));
        assert!(postgres.contains("back\\slash"));
        assert!(!postgres.contains("back\\\\slash"));

        let root = script(&install_engine(DatabaseEngine::Postgresql, "16", 5432, "ro\\ot"));
        assert!(root.contains("ALTER USER postgres PASSWORD"));
        assert!(!root.contains("ro\\\\ot"));
    }

    #[test]
    fn test_postgres_schema_uses_psql() {
        let commands = create_schema(DatabaseEngine::Postgresql, "shop", "utf8mb4", "rootpw");
        assert!(commands[0].script.starts_with("sudo -u postgres psql"));
        assert!(commands[0].script.contains("CREATE DATABASE \"shop\""));
    }

    #[test]
    fn test_engine_install_sets_port_and_root_password() {
        let commands = install_engine(DatabaseEngine::Mysql, "8.0", 3307, "rootpw");
        let script = script(&commands);
        assert!(script.contains("install -y mysql-server"));
        assert!(script.contains("port = 3307"));
        assert!(script.contains("IDENTIFIED WITH caching_sha2_password BY 'rootpw'"));
    }

    #[test]
    fn test_remove_stops_service_best_effort() {
        let commands = remove_engine(DatabaseEngine::Mariadb);
        assert!(commands[0].best_effort);
        assert!(!commands[1].best_effort);
    }

    #[test]
    fn test_classify_access_denied() {
        assert!(classify("ERROR 1045 (28000): Access denied for user 'root'@'localhost'").is_some());
        assert!(classify("something else").is_none());
    }
}
