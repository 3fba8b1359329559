//! The production routing table.
//!
//! Subjects are owned by the downstream domain services; the gateway only
//! declares which verb+path maps to which subject, and how the payload is
//! assembled. Declaration order is significant: the first match wins.

use super::{PayloadSpec, RouteRule};
use cg_common::Verb::{DELETE, GET, PATCH, POST, PUT};

const IDEMPOTENCY: &[(&str, &str)] = &[("x-idempotency-key", "idempotencyKey")];

pub fn default_rules() -> Vec<RouteRule> {
    vec![
        // ------------------------------------------------------------------
        // Identity
        // ------------------------------------------------------------------
        RouteRule::new(POST, "/auth/register", "auth.register", PayloadSpec::body()),
        RouteRule::new(POST, "/auth/login", "auth.login", PayloadSpec::body()),
        RouteRule::new(POST, "/auth/refresh", "auth.refresh", PayloadSpec::body()),
        RouteRule::new(
            POST,
            "/auth/logout",
            "auth.logout",
            PayloadSpec::empty().require_auth(),
        ),
        RouteRule::new(
            GET,
            "/auth/profile",
            "auth.profile",
            PayloadSpec::empty().require_user(),
        ),
        RouteRule::new(
            GET,
            "/students",
            "auth.students.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/students/:id",
            "auth.students.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/students", "auth.students.create", PayloadSpec::body()),
        RouteRule::new(
            PATCH,
            "/students/:id",
            "auth.students.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/students/:id",
            "auth.students.remove",
            PayloadSpec::params(&["id"]),
        ),
        // ------------------------------------------------------------------
        // Curriculum: courses, programs, subjects
        // ------------------------------------------------------------------
        RouteRule::new(
            GET,
            "/courses",
            "programs.courses.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/courses/:id",
            "programs.courses.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/courses", "programs.courses.create", PayloadSpec::body()),
        RouteRule::new(
            PUT,
            "/courses/:id",
            "programs.courses.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            PATCH,
            "/courses/:id",
            "programs.courses.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/courses/:id",
            "programs.courses.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/programs",
            "programs.programs.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/programs/:id",
            "programs.programs.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/programs", "programs.programs.create", PayloadSpec::body()),
        RouteRule::new(
            PATCH,
            "/programs/:id",
            "programs.programs.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/programs/:id",
            "programs.programs.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/programs/:id/courses",
            "programs.programs.courses",
            PayloadSpec::params(&["id"]).with_query(),
        ),
        RouteRule::new(
            GET,
            "/subjects",
            "programs.subjects.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/subjects/:id",
            "programs.subjects.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/subjects", "programs.subjects.create", PayloadSpec::body()),
        RouteRule::new(
            PATCH,
            "/subjects/:id",
            "programs.subjects.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/subjects/:id",
            "programs.subjects.remove",
            PayloadSpec::params(&["id"]),
        ),
        // ------------------------------------------------------------------
        // Calendar
        // ------------------------------------------------------------------
        RouteRule::new(
            GET,
            "/calendar/periods",
            "calendar.periods.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/calendar/periods/:id",
            "calendar.periods.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            POST,
            "/calendar/periods",
            "calendar.periods.create",
            PayloadSpec::body(),
        ),
        RouteRule::new(
            PATCH,
            "/calendar/periods/:id",
            "calendar.periods.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/calendar/periods/:id",
            "calendar.periods.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/calendar/events",
            "calendar.events.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/calendar/events/:id",
            "calendar.events.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            POST,
            "/calendar/events",
            "calendar.events.create",
            PayloadSpec::body(),
        ),
        RouteRule::new(
            PATCH,
            "/calendar/events/:id",
            "calendar.events.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/calendar/events/:id",
            "calendar.events.remove",
            PayloadSpec::params(&["id"]),
        ),
        // ------------------------------------------------------------------
        // Facilities
        // ------------------------------------------------------------------
        RouteRule::new(
            GET,
            "/rooms",
            "facilities.rooms.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/rooms/:id",
            "facilities.rooms.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/rooms", "facilities.rooms.create", PayloadSpec::body()),
        RouteRule::new(
            PATCH,
            "/rooms/:id",
            "facilities.rooms.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/rooms/:id",
            "facilities.rooms.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/rooms/:id/availability",
            "facilities.rooms.availability",
            PayloadSpec::params(&["id"]).with_query(),
        ),
        // ------------------------------------------------------------------
        // Teaching: teachers, course sections
        // ------------------------------------------------------------------
        RouteRule::new(
            GET,
            "/teachers",
            "teaching.teachers.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/teachers/:id",
            "teaching.teachers.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/teachers", "teaching.teachers.create", PayloadSpec::body()),
        RouteRule::new(
            PATCH,
            "/teachers/:id",
            "teaching.teachers.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/teachers/:id",
            "teaching.teachers.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/teachers/:id/sections",
            "teaching.teachers.sections",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/course-sections",
            "teaching.sections.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/course-sections/:id",
            "teaching.sections.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            POST,
            "/course-sections",
            "teaching.sections.create",
            PayloadSpec::body(),
        ),
        RouteRule::new(
            PATCH,
            "/course-sections/:id",
            "teaching.sections.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/course-sections/:id",
            "teaching.sections.remove",
            PayloadSpec::params(&["id"]),
        ),
        // ------------------------------------------------------------------
        // Enrollment
        // ------------------------------------------------------------------
        RouteRule::new(
            GET,
            "/enrollments",
            "enrollments.find_all",
            PayloadSpec::empty().with_query().with_user(),
        ),
        RouteRule::new(
            GET,
            "/enrollments/:id",
            "enrollments.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            POST,
            "/enrollments",
            "enrollments.create",
            PayloadSpec::empty().with_body().require_user(),
        ),
        RouteRule::new(
            PATCH,
            "/enrollments/:id",
            "enrollments.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/enrollments/:id",
            "enrollments.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/enrollment-details",
            "enrollment-details.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/enrollment-details/:id",
            "enrollment-details.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            POST,
            "/enrollment-details",
            "enrollment-details.create",
            PayloadSpec::body(),
        ),
        RouteRule::new(
            PATCH,
            "/enrollment-details/:id",
            "enrollment-details.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/enrollment-details/:id",
            "enrollment-details.remove",
            PayloadSpec::params(&["id"]),
        ),
        // Atomic enrollment carries a client idempotency key end to end.
        RouteRule::new(
            POST,
            "/atomic-enrollment/enroll",
            "enrollments.atomic.enroll",
            PayloadSpec::empty().with_body().require_header(IDEMPOTENCY),
        ),
        RouteRule::new(
            POST,
            "/atomic-enrollment/drop",
            "enrollments.atomic.drop",
            PayloadSpec::empty().with_body().require_header(IDEMPOTENCY),
        ),
        RouteRule::new(
            POST,
            "/atomic-enrollment/swap",
            "enrollments.atomic.swap",
            PayloadSpec::empty().with_body().require_header(IDEMPOTENCY),
        ),
        RouteRule::new(
            GET,
            "/academic-history/:studentId",
            "enrollments.academic.history",
            PayloadSpec::params(&["studentId"]).with_query(),
        ),
        RouteRule::new(
            GET,
            "/schedules/:studentId",
            "enrollments.academic.schedule",
            PayloadSpec::params(&["studentId"]),
        ),
        RouteRule::new(
            GET,
            "/academic-performance/:studentId",
            "enrollments.performance.summary",
            PayloadSpec::params(&["studentId"]).with_query(),
        ),
        // ------------------------------------------------------------------
        // Assessment
        // ------------------------------------------------------------------
        RouteRule::new(
            GET,
            "/grades",
            "grades.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/grades/:id",
            "grades.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(POST, "/grades", "grades.create", PayloadSpec::body()),
        RouteRule::new(
            PATCH,
            "/grades/:id",
            "grades.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/grades/:id",
            "grades.remove",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            GET,
            "/assessments",
            "grades.assessments.find_all",
            PayloadSpec::empty().with_query(),
        ),
        RouteRule::new(
            GET,
            "/assessments/:id",
            "grades.assessments.find_one",
            PayloadSpec::params(&["id"]),
        ),
        RouteRule::new(
            POST,
            "/assessments",
            "grades.assessments.create",
            PayloadSpec::body(),
        ),
        RouteRule::new(
            PATCH,
            "/assessments/:id",
            "grades.assessments.update",
            PayloadSpec::params(&["id"]).with_body(),
        ),
        RouteRule::new(
            DELETE,
            "/assessments/:id",
            "grades.assessments.remove",
            PayloadSpec::params(&["id"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_duplicate_verb_template_pairs() {
        let rules = default_rules();
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            let key = format!("{:?} {:?}", rule.verb, rule.template);
            assert!(seen.insert(key), "duplicate rule: {:?}", rule.subject);
        }
    }

    #[test]
    fn subjects_are_hierarchical() {
        for rule in default_rules() {
            assert!(
                rule.subject.contains('.') || rule.subject.starts_with("enrollments"),
                "flat subject: {}",
                rule.subject
            );
        }
    }
}
