use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::auth::{self, Role};
use crate::db::now_timestamp;

/// Creates the bootstrap admin unless a live admin account exists.
/// Returns the new user id, or `None` when nothing was created.
pub fn ensure_admin(conn: &Connection, email: &str, password: &str) -> anyhow::Result<Option<i64>> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM users WHERE role = 'admin' AND is_deleted = 0 LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(None);
    }

    let hash = auth::hash_password(password)?;
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO users(email, password_hash, full_name, role, status, created_at, updated_at)
         VALUES(?, ?, 'Administrator', 'admin', 'active', ?, ?)",
        (email.trim().to_ascii_lowercase(), &hash, &now, &now),
    )
    .with_context(|| format!("failed to create admin {email}"))?;
    let id = conn.last_insert_rowid();
    info!(user_id = id, email = %email, "bootstrap admin created");
    Ok(Some(id))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoSummary {
    pub teachers: usize,
    pub students: usize,
    pub subjects: usize,
}

const DEMO_SUBJECTS: [(&str, &str, i64); 3] = [
    ("IT101", "Introduction to Programming", 3),
    ("IT202", "Database Systems", 3),
    ("MA105", "Discrete Mathematics", 2),
];

/// Demo data for a fresh database. Skipped when any major exists.
pub fn seed_demo(conn: &Connection) -> anyhow::Result<Option<DemoSummary>> {
    let majors: i64 = conn.query_row("SELECT COUNT(*) FROM majors", [], |r| r.get(0))?;
    if majors > 0 {
        return Ok(None);
    }

    let now = now_timestamp();
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO majors(code, name, description, created_at, updated_at)
         VALUES('IT', 'Information Technology', 'Software and systems', ?, ?)",
        (&now, &now),
    )?;
    let major_id = tx.last_insert_rowid();

    let teacher_user = insert_user(
        &tx,
        "teacher@sims.local",
        "teacher123",
        "Demo Teacher",
        Role::Teacher,
        &now,
    )?;
    tx.execute(
        "INSERT INTO teachers(user_id, teacher_code, department, degree)
         VALUES(?, 'GV0001', 'Information Technology', 'MSc')",
        [teacher_user],
    )?;
    let teacher_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO classes(code, name, major_id, academic_year, homeroom_teacher_id, max_students, status, created_at, updated_at)
         VALUES('IT-K20A', 'IT K20 A', ?, '2024-2025', ?, 40, 'active', ?, ?)",
        (major_id, teacher_id, &now, &now),
    )?;
    let class_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO semesters(name, academic_year, start_date, end_date, is_active, created_at, updated_at)
         VALUES('Semester 1', '2024-2025', '2024-09-01', '2025-01-15', 1, ?, ?)",
        (&now, &now),
    )?;

    for (code, name, credits) in DEMO_SUBJECTS {
        tx.execute(
            "INSERT INTO subjects(code, name, credits, teacher_id, major_id, status, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, 'active', ?, ?)",
            (code, name, credits, teacher_id, major_id, &now, &now),
        )?;
    }

    let mut students = 0;
    for n in 1..=3 {
        let user_id = insert_user(
            &tx,
            &format!("student{n}@sims.local"),
            "student123",
            &format!("Demo Student {n}"),
            Role::Student,
            &now,
        )?;
        tx.execute(
            "INSERT INTO students(user_id, student_code, class_id, major_id, enrollment_year)
             VALUES(?, ?, ?, ?, 2024)",
            (user_id, format!("SV{:04}", n), class_id, major_id),
        )?;
        students += 1;
    }

    tx.commit()?;
    let summary = DemoSummary {
        teachers: 1,
        students,
        subjects: DEMO_SUBJECTS.len(),
    };
    info!(?summary, "demo data seeded");
    Ok(Some(summary))
}

fn insert_user(
    conn: &Connection,
    email: &str,
    password: &str,
    full_name: &str,
    role: Role,
    now: &str,
) -> anyhow::Result<i64> {
    let hash = auth::hash_password(password)?;
    conn.execute(
        "INSERT INTO users(email, password_hash, full_name, role, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, 'active', ?, ?)",
        (email, &hash, full_name, role.as_str(), now, now),
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn admin_and_demo_seeding_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_connection(&dir.path().join("seed.sqlite3")).expect("open");
        db::migrate(&conn).expect("migrate");

        assert!(ensure_admin(&conn, "Admin@X.Y", "pw123456").unwrap().is_some());
        assert!(ensure_admin(&conn, "other@x.y", "pw123456").unwrap().is_none());
        let email: String = conn
            .query_row("SELECT email FROM users WHERE role = 'admin'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(email, "admin@x.y");

        let first = seed_demo(&conn).unwrap().expect("seeded");
        assert_eq!(first.students, 3);
        assert!(seed_demo(&conn).unwrap().is_none());

        let active: i64 = conn
            .query_row("SELECT COUNT(*) FROM semesters WHERE is_active = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(active, 1);
    }
}
