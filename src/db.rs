use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

pub fn open_connection(db_path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(Duration::from_secs(5))?;
    // Readers and the single writer share the file across pooled connections.
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    Ok(conn)
}

pub fn migrate(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('admin', 'teacher', 'student')),
            phone TEXT,
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'inactive')),
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    ensure_users_last_login_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role, is_deleted)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS majors(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL UNIQUE,
            teacher_code TEXT NOT NULL UNIQUE,
            department TEXT,
            degree TEXT,
            specialization TEXT,
            hire_date TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            major_id INTEGER,
            academic_year TEXT,
            homeroom_teacher_id INTEGER,
            max_students INTEGER NOT NULL DEFAULT 50 CHECK(max_students > 0),
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'inactive')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(major_id) REFERENCES majors(id),
            FOREIGN KEY(homeroom_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_major ON classes(major_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL UNIQUE,
            student_code TEXT NOT NULL UNIQUE,
            class_id INTEGER,
            major_id INTEGER,
            date_of_birth TEXT,
            gender TEXT CHECK(gender IS NULL OR gender IN ('male', 'female', 'other')),
            address TEXT,
            enrollment_year INTEGER,
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(major_id) REFERENCES majors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            credits INTEGER NOT NULL CHECK(credits > 0),
            description TEXT,
            teacher_id INTEGER,
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'inactive')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    ensure_subjects_major_id(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_teacher ON subjects(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(name, academic_year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            class_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            semester_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'registered'
                CHECK(status IN ('registered', 'completed', 'dropped')),
            enrolled_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(student_id, subject_id, semester_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_subject_semester
         ON enrollments(subject_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            class_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            semester_id INTEGER NOT NULL,
            teacher_id INTEGER,
            day_of_week INTEGER NOT NULL CHECK(day_of_week BETWEEN 1 AND 7),
            period INTEGER NOT NULL CHECK(period BETWEEN 1 AND 12),
            room TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(class_id, subject_id, semester_id, day_of_week, period)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_slot
         ON schedules(semester_id, day_of_week, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            semester_id INTEGER NOT NULL,
            process_score REAL CHECK(process_score IS NULL OR process_score BETWEEN 0 AND 10),
            midterm_score REAL CHECK(midterm_score IS NULL OR midterm_score BETWEEN 0 AND 10),
            final_score REAL CHECK(final_score IS NULL OR final_score BETWEEN 0 AND 10),
            average_score REAL GENERATED ALWAYS AS (
                ROUND(0.4 * process_score + 0.3 * midterm_score + 0.3 * final_score, 2)
            ) STORED,
            graded_by INTEGER,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(graded_by) REFERENCES teachers(id),
            UNIQUE(student_id, subject_id, semester_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject_semester
         ON grades(subject_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            class_id INTEGER,
            subject_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_reviews(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            grade_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'reviewed')),
            response TEXT,
            created_at TEXT NOT NULL,
            reviewed_at TEXT,
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_reviews_grade ON grade_reviews(grade_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grade_reviews_one_pending
         ON grade_reviews(grade_id) WHERE status = 'pending'",
        [],
    )?;

    Ok(())
}

// Databases created before login tracking lack this column.
fn ensure_users_last_login_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "last_login_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN last_login_at TEXT", [])?;
    Ok(())
}

fn ensure_subjects_major_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "major_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE subjects ADD COLUMN major_id INTEGER REFERENCES majors(id)",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Takes the write lock up front, so read-then-write sequences wait on
/// `busy_timeout` instead of failing with SQLITE_BUSY on upgrade.
pub fn write_transaction(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

/// Timestamp format stored in every `*_at` column.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc;

    fn fresh() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_connection(&dir.path().join("sims.sqlite3")).expect("open");
        migrate(&conn).expect("migrate");
        (dir, conn)
    }

    fn seed_refs(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO users(id, email, password_hash, full_name, role, created_at, updated_at)
               VALUES(1, 's@x.y', 'h', 'S', 'student', 't', 't');
             INSERT INTO users(id, email, password_hash, full_name, role, created_at, updated_at)
               VALUES(2, 't@x.y', 'h', 'T', 'teacher', 't', 't');
             INSERT INTO teachers(id, user_id, teacher_code) VALUES(1, 2, 'GV1');
             INSERT INTO classes(id, code, name, created_at, updated_at) VALUES(1, 'C1', 'C1', 't', 't');
             INSERT INTO students(id, user_id, student_code, class_id) VALUES(1, 1, 'SV1', 1);
             INSERT INTO subjects(id, code, name, credits, teacher_id, created_at, updated_at)
               VALUES(1, 'MATH', 'Math', 3, 1, 't', 't');
             INSERT INTO semesters(id, name, academic_year, start_date, end_date, created_at, updated_at)
               VALUES(1, 'HK1', '2024-2025', '2024-09-01', '2025-01-15', 't', 't');",
        )
        .expect("seed refs");
    }

    #[test]
    fn migrate_is_idempotent() {
        let (_dir, conn) = fresh();
        migrate(&conn).expect("second migrate");
        assert!(table_has_column(&conn, "users", "last_login_at").unwrap());
        assert!(table_has_column(&conn, "subjects", "major_id").unwrap());
    }

    #[test]
    fn average_score_is_generated_from_weights() {
        let (_dir, conn) = fresh();
        seed_refs(&conn);
        conn.execute(
            "INSERT INTO grades(student_id, subject_id, semester_id, process_score, midterm_score, final_score, created_at, updated_at)
             VALUES(1, 1, 1, 8.0, 7.0, 6.0, 't', 't')",
            [],
        )
        .unwrap();
        let avg: f64 = conn
            .query_row("SELECT average_score FROM grades WHERE student_id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(avg, calc::weighted_average(8.0, 7.0, 6.0));

        conn.execute("UPDATE grades SET final_score = NULL", []).unwrap();
        let avg: Option<f64> = conn
            .query_row("SELECT average_score FROM grades", [], |r| r.get(0))
            .unwrap();
        assert_eq!(avg, None);
    }

    #[test]
    fn composite_keys_reject_duplicates() {
        let (_dir, conn) = fresh();
        seed_refs(&conn);
        let enroll = "INSERT INTO enrollments(student_id, class_id, subject_id, semester_id, enrolled_at, updated_at)
                      VALUES(1, 1, 1, 1, 't', 't')";
        conn.execute(enroll, []).unwrap();
        assert!(conn.execute(enroll, []).is_err());

        let slot = "INSERT INTO schedules(class_id, subject_id, semester_id, day_of_week, period, created_at, updated_at)
                    VALUES(1, 1, 1, 2, 3, 't', 't')";
        conn.execute(slot, []).unwrap();
        assert!(conn.execute(slot, []).is_err());
    }

    #[test]
    fn only_one_pending_review_per_grade() {
        let (_dir, conn) = fresh();
        seed_refs(&conn);
        conn.execute(
            "INSERT INTO grades(id, student_id, subject_id, semester_id, process_score, created_at, updated_at)
             VALUES(1, 1, 1, 1, 5.0, 't', 't')",
            [],
        )
        .unwrap();
        let pending = "INSERT INTO grade_reviews(grade_id, student_id, reason, status, created_at)
                       VALUES(1, 1, 'r', 'pending', 't')";
        let tx = write_transaction(&conn).unwrap();
        tx.execute(pending, []).unwrap();
        assert!(tx.execute(pending, []).is_err());
        tx.commit().unwrap();

        conn.execute("UPDATE grade_reviews SET status = 'reviewed'", []).unwrap();
        conn.execute(pending, []).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM grade_reviews", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn score_range_and_foreign_keys_are_enforced() {
        let (_dir, conn) = fresh();
        seed_refs(&conn);
        assert!(conn
            .execute(
                "INSERT INTO grades(student_id, subject_id, semester_id, process_score, created_at, updated_at)
                 VALUES(1, 1, 1, 10.5, 't', 't')",
                [],
            )
            .is_err());
        assert!(conn
            .execute(
                "INSERT INTO students(user_id, student_code, class_id) VALUES(2, 'SV9', 999)",
                [],
            )
            .is_err());
    }
}
